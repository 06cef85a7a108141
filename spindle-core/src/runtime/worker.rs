//! The worker loop.
//!
//! A worker takes tasks off the manager's task queue until it has been idle
//! for too long or its closing flag is set. For every task it resolves cached
//! arguments, runs the operation on the blocking pool and posts exactly one
//! result.
use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::{
    broker::{flag::Flag, Handles},
    cache::CacheRef,
    error::BrokerError,
    operation::{self, ExecuteFn, OperationError},
    serializer::Serializer,
    task::{Argument, Outcome, Task, TaskResult},
};

const DEFAULT_IDLE_LIMIT: u32 = 60;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Consecutive empty polls after which the worker exits.
    pub idle_limit: u32,
    /// How long one poll of the task queue waits.
    pub poll_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            idle_limit: DEFAULT_IDLE_LIMIT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

pub struct Worker {
    name: String,
    handles: Handles,
    closing: Flag,
    options: WorkerOptions,
    /// Payloads fetched from the shared cache, kept for the worker's lifetime.
    local_cache: HashMap<CacheRef, Bytes>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        handles: Handles,
        closing: Flag,
        options: WorkerOptions,
    ) -> Self {
        Self {
            name: name.into(),
            handles,
            closing,
            options,
            local_cache: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process tasks until idle, closing or cancelled.
    ///
    /// Inactivity, the closing flag and cancellation all end the loop
    /// without error. A lost manager connection is an error.
    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<()> {
        debug!(worker = %self.name, "worker started");
        let mut idle = 0;

        while idle < self.options.idle_limit {
            if token.is_cancelled() || self.closing.is_set().await? {
                break;
            }

            let started = Instant::now();
            let polled = tokio::select! {
                _ = token.cancelled() => break,
                polled = self.handles.tasks.get(self.options.poll_timeout) => polled,
            };

            match polled {
                Ok(task) => {
                    idle = 0;
                    let span = info_span!(
                        "task",
                        worker = %self.name,
                        job_id = %task.job_id,
                        index = task.index,
                        operation = %task.operation,
                    );
                    self.process(task, started).instrument(span).await?;
                }
                Err(BrokerError::Timeout) => idle += 1,
                Err(err) => return Err(err.into()),
            }
        }

        debug!(worker = %self.name, idle_polls = idle, "worker finished");
        Ok(())
    }

    async fn process(&mut self, task: Task, started: Instant) -> anyhow::Result<()> {
        let args = match self.resolve(&task.args).await {
            Ok(args) => args,
            Err(BrokerError::NotFound(key)) => {
                error!(%key, "task references a missing cache entry");
                let outcome = Outcome::Err(format!("cache entry not found: {key}"));
                self.handles
                    .results
                    .put(TaskResult::new(&task, outcome))
                    .await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        self.handles
            .statistics
            .add_transfer_time(&self.name, started.elapsed())
            .await?;

        let started = Instant::now();
        let outcome = run(&task, args).await;
        self.handles
            .results
            .put(TaskResult::new(&task, outcome))
            .await?;
        self.handles
            .statistics
            .add_process_time(&self.name, started.elapsed())
            .await?;

        Ok(())
    }

    /// Substitute cached payloads, fetching each one from the manager only
    /// the first time this worker sees it.
    async fn resolve(&mut self, args: &[Argument]) -> Result<Arc<[Bytes]>, BrokerError> {
        let mut resolved = Vec::with_capacity(args.len());
        for arg in args {
            let value = match arg {
                Argument::Value(value) => value.clone(),
                Argument::Cached(key) => match self.local_cache.get(key) {
                    Some(value) => value.clone(),
                    None => {
                        let value = self.handles.cache.get(key).await?;
                        debug!(%key, size = value.len(), "fetched cache entry");
                        self.local_cache.insert(key.clone(), value.clone());
                        value
                    }
                },
            };
            resolved.push(value);
        }

        Ok(resolved.into())
    }
}

async fn run(task: &Task, args: Arc<[Bytes]>) -> Outcome {
    let Some(entry) = operation::lookup(&task.operation) else {
        error!("operation is not registered in this binary");
        return Outcome::Err(format!("unknown operation: {}", task.operation));
    };

    match execute(entry.execute, task.serializer, task.op.clone(), args).await {
        Ok(output) => Outcome::Ok(output),
        Err(err) => {
            error!(%err, "task failed");
            Outcome::Err(err.to_string())
        }
    }
}

/// Run a registered operation on the blocking pool.
///
/// Transient errors are retried with the strategy they carry. A panic inside
/// the operation is reported as a fatal error.
pub(crate) async fn execute(
    execute: ExecuteFn,
    serializer: Serializer,
    op: Bytes,
    args: Arc<[Bytes]>,
) -> operation::Result<Bytes> {
    let attempt = || {
        let op = op.clone();
        let args = args.clone();
        async move {
            tokio::task::spawn_blocking(move || execute(serializer, &op, &args))
                .await
                .unwrap_or_else(|err| Err(OperationError::fatal(join_error(err))))
        }
    };

    match attempt().await {
        Err(err @ OperationError::Transient { .. }) => {
            err.retry_trace(attempt, |err| warn!(%err, "retrying operation"))
                .await
        }
        outcome => outcome,
    }
}

fn join_error(err: tokio::task::JoinError) -> anyhow::Error {
    if !err.is_panic() {
        return anyhow!("operation was cancelled");
    }

    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    anyhow!("operation panicked: {message}")
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        broker::Manager,
        operation::{Operation, RemoteExecute, Result},
        task::JobId,
    };

    const FAST: WorkerOptions = WorkerOptions {
        idle_limit: 3,
        poll_timeout: Duration::from_millis(20),
    };

    #[derive(Serialize, Deserialize, crate::RemoteExecute)]
    #[spindle(internal)]
    struct Scale(f64);

    impl Operation for Scale {
        type Input = (Vec<f64>, f64);
        type Output = f64;

        fn execute(&self, (profile, x): Self::Input) -> Result<Self::Output> {
            if x < 0.0 {
                panic!("negative coordinate");
            }
            let index = (x as usize).min(profile.len().saturating_sub(1));
            profile
                .get(index)
                .map(|z| z * self.0)
                .ok_or_else(|| OperationError::fatal_str("empty profile"))
        }
    }

    fn task(serializer: Serializer, job_id: JobId, index: usize, x: f64) -> Task {
        Task {
            job_id,
            index,
            operation: Scale::NAME.to_string(),
            op: Scale(2.0).as_bytes(serializer).unwrap(),
            args: vec![
                Argument::Cached(CacheRef::new("profile")),
                Argument::Value(serializer.to_bytes(&x).unwrap()),
            ],
            serializer,
        }
    }

    async fn run_worker(manager: &Manager, name: &str) {
        let worker = Worker::new(name, manager.handles(), manager.flag("closing"), FAST);
        worker.run(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn idle_worker_exits_without_consuming_tasks() {
        let manager = Manager::local();
        run_worker(&manager, "worker-idle").await;

        let job_id = JobId::new();
        manager
            .tasks()
            .put(task(Serializer::Postcard, job_id, 0, 1.0))
            .await
            .unwrap();
        assert_eq!(manager.tasks().qsize().await.unwrap(), 1);
        assert!(manager.results().empty().await.unwrap());
    }

    #[tokio::test]
    async fn closing_flag_stops_the_worker() {
        let manager = Manager::local();
        manager.flag("closing").set().await.unwrap();
        manager
            .tasks()
            .put(task(Serializer::Postcard, JobId::new(), 0, 1.0))
            .await
            .unwrap();

        run_worker(&manager, "worker-closing").await;
        assert_eq!(manager.tasks().qsize().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tasks_resolve_cached_arguments() {
        let manager = Manager::local();
        let serializer = Serializer::Cbor;
        manager
            .cache()
            .add(
                &CacheRef::new("profile"),
                serializer.to_bytes(&vec![1.0, 2.0, 3.0]).unwrap(),
            )
            .await
            .unwrap();

        let job_id = JobId::new();
        for (index, x) in [0.0, 2.0].into_iter().enumerate() {
            manager
                .tasks()
                .put(task(serializer, job_id, index, x))
                .await
                .unwrap();
        }
        run_worker(&manager, "worker-a").await;

        let mut outputs = vec![];
        while let Ok(result) = manager.results().get(FAST.poll_timeout).await {
            assert_eq!(result.job_id, job_id);
            match result.outcome {
                Outcome::Ok(bytes) => {
                    outputs.push((result.index, serializer.from_bytes::<f64>(&bytes).unwrap()))
                }
                Outcome::Err(err) => panic!("task failed: {err}"),
            }
        }
        assert_eq!(outputs, [(0, 2.0), (1, 6.0)]);

        let stats = manager.statistics().get_stats().await.unwrap();
        assert!(stats.starts_with("Process worker-a: "), "{stats}");
        assert!(stats.contains("/2)"), "{stats}");
    }

    #[tokio::test]
    async fn failures_become_error_results() {
        let manager = Manager::local();
        let serializer = Serializer::Postcard;
        let job_id = JobId::new();

        // Cache miss.
        manager
            .tasks()
            .put(task(serializer, job_id, 0, 1.0))
            .await
            .unwrap();
        // Unregistered operation.
        let mut unknown = task(serializer, job_id, 1, 1.0);
        unknown.operation = "nowhere::Missing".into();
        unknown.args.truncate(0);
        manager.tasks().put(unknown).await.unwrap();
        run_worker(&manager, "worker-b").await;

        // Panic inside the operation.
        manager
            .cache()
            .add(
                &CacheRef::new("profile"),
                serializer.to_bytes(&vec![1.0]).unwrap(),
            )
            .await
            .unwrap();
        manager
            .tasks()
            .put(task(serializer, job_id, 2, -1.0))
            .await
            .unwrap();
        run_worker(&manager, "worker-c").await;

        let mut errors = vec![];
        while let Ok(result) = manager.results().get(FAST.poll_timeout).await {
            match result.outcome {
                Outcome::Err(message) => errors.push((result.index, message)),
                Outcome::Ok(_) => panic!("task {} should have failed", result.index),
            }
        }

        assert_eq!(errors.len(), 3);
        assert!(errors[0].1.contains("cache entry not found: profile"));
        assert!(errors[1].1.contains("unknown operation: nowhere::Missing"));
        assert!(errors[2].1.contains("negative coordinate"));
    }
}
