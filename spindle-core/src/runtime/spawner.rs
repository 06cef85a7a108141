//! The spawner daemon.
//!
//! The spawner watches the task queue and starts a fixed set of workers when
//! work appears. It then waits for all of them to exit (they stop on their
//! own after a stretch of inactivity) before it watches the queue again:
//!
//! ```text
//! Idle --(tasks pending)--> Spawning --> AwaitCompletion --(all exited)--> Idle
//!   \____________________ closing flag or cancel ____________________> Stopped
//! ```
use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::{process::Command, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::worker::{Worker, WorkerOptions};
use crate::{
    broker::{flag::Flag, Handles},
    config::RemoteAddress,
    queue::Queue,
    serializer::Serializer,
    task::Task,
};

/// How long the spawner sleeps while the task queue is empty.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnerState {
    Idle,
    Spawning,
    AwaitCompletion,
    Stopped,
}

/// Starts one worker. The returned handle resolves when the worker exits.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, name: &str) -> anyhow::Result<JoinHandle<anyhow::Result<()>>>;
}

/// Runs workers as tasks of the current tokio runtime.
pub struct InProcessLauncher {
    handles: Handles,
    closing: Flag,
    options: WorkerOptions,
    token: CancellationToken,
}

impl InProcessLauncher {
    pub fn new(
        handles: Handles,
        closing: Flag,
        options: WorkerOptions,
        token: CancellationToken,
    ) -> Self {
        Self {
            handles,
            closing,
            options,
            token,
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, name: &str) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        let worker = Worker::new(
            name,
            self.handles.clone(),
            self.closing.clone(),
            self.options,
        );
        Ok(tokio::spawn(worker.run(self.token.child_token())))
    }
}

/// Runs each worker as a separate OS process that joins the manager as a
/// client.
///
/// The program must accept
/// `worker --remote-address <addr> --worker-name <name> --closing-flag <flag>`
/// and read the credentials from `SPINDLE_CREDENTIALS`, as `spindle-node`
/// does. A worker process is killed when its handle is aborted.
pub struct ProcessLauncher {
    pub program: PathBuf,
    pub address: RemoteAddress,
    pub credentials: String,
    pub serializer: Serializer,
    pub closing: String,
    pub idle_limit: u32,
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, name: &str) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .args(["--remote-address", &self.address.to_string()])
            .args(["--worker-name", name])
            .args(["--closing-flag", &self.closing])
            .args(["--worker-idle-limit", &self.idle_limit.to_string()])
            .args(["--serializer", &self.serializer.to_string()])
            .env("SPINDLE_CREDENTIALS", &self.credentials)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", self.program.display()))?;
        debug!(worker = name, pid = child.id(), "launched worker process");

        let name = name.to_string();
        Ok(tokio::spawn(async move {
            let status = child.wait().await?;
            if !status.success() {
                bail!("worker process {name} exited with {status}");
            }
            Ok(())
        }))
    }
}

pub struct Spawner {
    tasks: Arc<dyn Queue<Task>>,
    closing: Flag,
    launcher: Arc<dyn WorkerLauncher>,
    worker_names: Vec<String>,
    state: SpawnerState,
}

impl Spawner {
    /// A spawner for `worker_count` workers. Worker names are generated once
    /// and reused for every round.
    pub fn new(
        tasks: Arc<dyn Queue<Task>>,
        closing: Flag,
        launcher: Arc<dyn WorkerLauncher>,
        worker_count: usize,
    ) -> Self {
        let worker_names = (0..worker_count)
            .map(|_| format!("worker-{}", Uuid::new_v4()))
            .collect();

        Self {
            tasks,
            closing,
            launcher,
            worker_names,
            state: SpawnerState::Idle,
        }
    }

    pub fn worker_names(&self) -> &[String] {
        &self.worker_names
    }

    pub fn state(&self) -> SpawnerState {
        self.state
    }

    fn transition(&mut self, state: SpawnerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "spawner state changed");
            self.state = state;
        }
    }

    /// Run until the closing flag is set or `token` is cancelled. Cancelling
    /// aborts the running workers.
    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<SpawnerState> {
        info!(workers = ?self.worker_names, "spawner started");

        loop {
            if token.is_cancelled() || self.closing.is_set().await? {
                break;
            }

            if self.tasks.empty().await? {
                self.transition(SpawnerState::Idle);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                }
            }

            self.transition(SpawnerState::Spawning);
            let mut names = Vec::with_capacity(self.worker_names.len());
            let mut workers = Vec::with_capacity(self.worker_names.len());
            for name in &self.worker_names {
                match self.launcher.launch(name).await {
                    Ok(handle) => {
                        names.push(name.clone());
                        workers.push(handle);
                    }
                    Err(err) => error!(worker = %name, %err, "failed to launch worker"),
                }
            }
            if workers.is_empty() {
                bail!("no worker could be launched");
            }

            self.transition(SpawnerState::AwaitCompletion);
            let exited = tokio::select! {
                exited = join_all(workers.iter_mut()) => Some(exited),
                _ = token.cancelled() => None,
            };
            let Some(exited) = exited else {
                workers.iter().for_each(JoinHandle::abort);
                break;
            };

            for (name, outcome) in names.iter().zip(exited) {
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(worker = %name, %err, "worker failed"),
                    Err(err) => warn!(worker = %name, %err, "worker aborted"),
                }
            }
            debug!("all workers exited");
        }

        self.transition(SpawnerState::Stopped);
        info!("spawner stopped");
        Ok(self.state)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use bytes::Bytes;

    use super::*;
    use crate::{broker::Manager, task::JobId};

    /// Records launches and drains one task per launched worker.
    #[derive(Default)]
    struct Recorder {
        launched: Mutex<Vec<String>>,
        tasks_taken: AtomicUsize,
    }

    struct RecordingLauncher {
        tasks: Arc<dyn Queue<Task>>,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl WorkerLauncher for RecordingLauncher {
        async fn launch(&self, name: &str) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
            self.recorder.launched.lock().unwrap().push(name.to_string());
            let tasks = self.tasks.clone();
            let recorder = self.recorder.clone();
            Ok(tokio::spawn(async move {
                if tasks.get(Duration::from_millis(10)).await.is_ok() {
                    recorder.tasks_taken.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }))
        }
    }

    fn task() -> Task {
        Task {
            job_id: JobId::new(),
            index: 0,
            operation: "geometry::PushCutter".into(),
            op: Bytes::new(),
            args: vec![],
            serializer: Serializer::Postcard,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn spawns_a_full_round_when_work_appears() {
        let manager = Manager::local();
        let recorder = Arc::new(Recorder::default());
        let launcher = Arc::new(RecordingLauncher {
            tasks: manager.tasks(),
            recorder: recorder.clone(),
        });
        let spawner = Spawner::new(manager.tasks(), manager.flag("closing"), launcher, 3);
        let names = spawner.worker_names().to_vec();
        assert_eq!(spawner.state(), SpawnerState::Idle);

        let closing = manager.flag("closing");
        let running = tokio::spawn(spawner.run(CancellationToken::new()));

        tokio::time::sleep(POLL_INTERVAL).await;
        assert!(recorder.launched.lock().unwrap().is_empty());

        for _ in 0..3 {
            manager.tasks().put(task()).await.unwrap();
        }
        while recorder.tasks_taken.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        closing.set().await.unwrap();
        assert_eq!(running.await.unwrap().unwrap(), SpawnerState::Stopped);

        let launched = recorder.launched.lock().unwrap().clone();
        assert_eq!(launched.len() % 3, 0);
        assert_eq!(&launched[..3], &names[..]);
        assert!(names.iter().all(|name| name.starts_with("worker-")));
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_spawner() {
        let manager = Manager::local();
        let launcher = Arc::new(RecordingLauncher {
            tasks: manager.tasks(),
            recorder: Default::default(),
        });
        let spawner = Spawner::new(manager.tasks(), manager.flag("closing"), launcher, 2);
        let token = CancellationToken::new();
        let running = tokio::spawn(spawner.run(token.clone()));

        token.cancel();
        assert_eq!(running.await.unwrap().unwrap(), SpawnerState::Stopped);
    }
}
