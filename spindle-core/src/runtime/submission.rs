//! Submitting batches and collecting their results.
//!
//! A batch is one operation applied to a list of argument tuples. Each batch
//! gets a fresh [`JobId`], and its results come back as a [`JobStream`].
//!
//! # Stray results
//!
//! Every submitter attached to a manager pulls from the same result queue, so
//! a submitter may dequeue a result that belongs to somebody else. Such a
//! result is dropped if its job was cancelled recently (it is in the
//! [`FinishedJobs`] set), and otherwise put back for its owner after a random
//! backoff. A result put back more than [`MAX_REQUEUES`] times is dropped
//! with a warning: its owner is most likely gone.
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::{
    lock::Mutex,
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use pin_project::{pin_project, pinned_drop};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::execute;
use crate::{
    broker::{flag::Flag, Manager},
    cache::{Cache, CacheRef},
    error::BrokerError,
    operation::{execute_registered, Operation},
    queue::Queue,
    serializer::{Serializable, Serializer},
    statistics::Statistics,
    task::{Arg, Argument, JobId, Outcome, Task, TaskResult},
};

/// How many cancelled jobs are remembered.
pub const FINISHED_JOBS_CAPACITY: usize = 10;

/// How often a stray result may be put back before it is dropped.
pub const MAX_REQUEUES: u32 = 120;

const RESULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Yield results as they complete instead of in submission order.
    pub unordered: bool,
    /// Run the batch sequentially in the calling process.
    pub disable_parallelism: bool,
}

/// The most recently cancelled jobs, oldest first.
#[derive(Clone, Debug, Default)]
pub struct FinishedJobs {
    jobs: VecDeque<JobId>,
}

impl FinishedJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job, evicting the oldest entries beyond
    /// [`FINISHED_JOBS_CAPACITY`].
    pub fn insert(&mut self, job_id: JobId) {
        self.jobs.push_back(job_id);
        while self.jobs.len() > FINISHED_JOBS_CAPACITY {
            self.jobs.pop_front();
        }
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.jobs.contains(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Encode the arguments of every tuple inline.
pub(crate) fn encode_inline<'a, I>(batches: I, serializer: Serializer) -> Result<Vec<Arc<[Bytes]>>>
where
    I: IntoIterator<Item = Vec<Arg<'a>>>,
{
    batches
        .into_iter()
        .map(|batch| {
            batch
                .iter()
                .map(|arg| arg.encode(serializer))
                .collect::<Result<Vec<_>>>()
                .map(Into::into)
        })
        .collect()
}

/// Run a batch in this process, `width` tuples at a time.
///
/// Operations go through the same encode, execute, decode path a worker
/// uses, so a batch behaves the same locally and remotely.
pub(crate) fn run_local<Op: Operation>(
    op: &Op,
    batches: Vec<Arc<[Bytes]>>,
    serializer: Serializer,
    width: usize,
    unordered: bool,
) -> Result<JobStream<Op::Output>> {
    let op = op.as_bytes(serializer)?;
    let outputs = stream::iter(batches).map(move |args| {
        let op = op.clone();
        async move {
            let output = execute(execute_registered::<Op>, serializer, op, args).await?;
            serializer.from_bytes::<Op::Output>(&output)
        }
    });

    let width = width.max(1);
    let inner = if unordered {
        outputs.buffer_unordered(width).boxed()
    } else {
        outputs.buffered(width).boxed()
    };

    Ok(JobStream::new(inner, None))
}

/// Everything a submitter needs from its runtime to talk to the manager.
pub(crate) struct Submitter<'a> {
    pub manager: &'a Manager,
    pub closing: &'a Flag,
    /// Cancelled when the owning runtime shuts down.
    pub shutdown: &'a CancellationToken,
    pub source_id: &'a str,
    pub finished_jobs: &'a Arc<Mutex<FinishedJobs>>,
    pub serializer: Serializer,
}

impl Submitter<'_> {
    /// Cache shared arguments, enqueue one task per tuple and return the
    /// stream of their results.
    pub(crate) async fn submit<'a, Op, I>(
        &self,
        op: &Op,
        batches: I,
        unordered: bool,
    ) -> Result<JobStream<Op::Output>>
    where
        Op: Operation,
        I: IntoIterator<Item = Vec<Arg<'a>>>,
    {
        let job_id = JobId::new();
        let serializer = self.serializer;
        let op_bytes = op.as_bytes(serializer)?;
        let tasks = self.manager.tasks();
        let cache = self.manager.cache();
        let statistics = self.manager.statistics();
        debug!(%job_id, operation = Op::NAME, "starting parallel tasks");

        let mut cached = HashSet::new();
        let mut total = 0;
        for (index, batch) in batches.into_iter().enumerate() {
            let started = Instant::now();
            let mut args = Vec::with_capacity(batch.len());
            for arg in batch {
                let argument = match arg {
                    Arg::Value(value) => Argument::Value(value.encode(serializer)?),
                    Arg::Shared(value) => {
                        let key = value.cache_ref();
                        if cached.insert(key.clone()) {
                            cache_once(cache.as_ref(), &key, || value.encode(serializer), job_id)
                                .await?;
                        }
                        Argument::Cached(key)
                    }
                };
                args.push(argument);
            }

            tasks
                .put(Task {
                    job_id,
                    index,
                    operation: Op::NAME.to_string(),
                    op: op_bytes.clone(),
                    args,
                    serializer,
                })
                .await?;
            statistics
                .add_queueing_time(self.source_id, started.elapsed())
                .await?;
            total = index + 1;
        }
        debug!(%job_id, tasks = total, "added tasks");

        let collector = Collector {
            job_id,
            total,
            yielded: 0,
            next_index: 0,
            pending: BTreeMap::new(),
            unordered,
            results: self.manager.results(),
            statistics: statistics.clone(),
            closing: self.closing.clone(),
            shutdown: self.shutdown.clone(),
            finished_jobs: self.finished_jobs.clone(),
            serializer,
            _output: PhantomData,
        };
        let cancellation = Cancellation {
            job_id,
            tasks,
            statistics,
            finished_jobs: self.finished_jobs.clone(),
        };

        Ok(JobStream::new(collector.into_stream(), Some(cancellation)))
    }
}

async fn cache_once(
    cache: &dyn Cache,
    key: &CacheRef,
    encode: impl FnOnce() -> Result<Bytes>,
    job_id: JobId,
) -> Result<()> {
    if cache.contains(key).await? {
        return Ok(());
    }
    debug!(%job_id, %key, "adding item to the manager's cache");
    cache.add(key, encode()?).await?;
    Ok(())
}

/// Pulls the results of one job off the shared result queue.
struct Collector<O> {
    job_id: JobId,
    total: usize,
    yielded: usize,
    next_index: usize,
    /// Results that arrived ahead of their turn, by task index.
    pending: BTreeMap<usize, Outcome>,
    unordered: bool,
    results: Arc<dyn Queue<TaskResult>>,
    statistics: Arc<dyn Statistics>,
    closing: Flag,
    shutdown: CancellationToken,
    finished_jobs: Arc<Mutex<FinishedJobs>>,
    serializer: Serializer,
    _output: PhantomData<fn() -> O>,
}

impl<O: Serializable> Collector<O> {
    fn into_stream(self) -> BoxStream<'static, Result<O>> {
        stream::unfold(self, |mut collector| async move {
            collector.next().await.map(|item| (item, collector))
        })
        .boxed()
    }

    async fn next(&mut self) -> Option<Result<O>> {
        if self.yielded >= self.total {
            return None;
        }

        let item = match self.next_outcome().await {
            Ok(outcome) => self.decode(outcome),
            Err(err) => {
                // The stream cannot make progress anymore.
                self.yielded = self.total;
                return Some(Err(err));
            }
        };

        self.yielded += 1;
        if self.yielded == self.total {
            debug!(job_id = %self.job_id, "parallel processing finished");
            log_stats(self.statistics.as_ref()).await;
        }
        Some(item)
    }

    async fn next_outcome(&mut self) -> Result<Outcome> {
        loop {
            if !self.unordered {
                if let Some(outcome) = self.pending.remove(&self.next_index) {
                    self.next_index += 1;
                    return Ok(outcome);
                }
            }

            let result = match self.results.get(RESULT_POLL_TIMEOUT).await {
                Ok(result) => result,
                Err(BrokerError::Timeout) => {
                    if self.shutdown.is_cancelled() || self.closing.is_set().await? {
                        return Err(anyhow!(
                            "runtime is shutting down, job {} is incomplete",
                            self.job_id
                        ));
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if result.job_id != self.job_id {
                self.handle_stray(result).await?;
                continue;
            }
            if self.unordered {
                return Ok(result.outcome);
            }
            self.pending.insert(result.index, result.outcome);
        }
    }

    async fn handle_stray(&self, mut result: TaskResult) -> Result<()> {
        if self.finished_jobs.lock().await.contains(&result.job_id) {
            debug!(job_id = %result.job_id, "throwing away a result of a cancelled job");
            return Ok(());
        }
        if result.requeues >= MAX_REQUEUES {
            warn!(
                job_id = %result.job_id,
                requeues = result.requeues,
                "dropping a result nobody collected"
            );
            return Ok(());
        }

        debug!(job_id = %result.job_id, "skipping result of another submitter");
        result.requeues += 1;
        self.results.put(result).await?;

        let backoff = Duration::from_millis(rand::thread_rng().gen_range(500..1500));
        tokio::time::sleep(backoff).await;
        Ok(())
    }

    fn decode(&self, outcome: Outcome) -> Result<O> {
        match outcome {
            Outcome::Ok(output) => self.serializer.from_bytes(&output),
            Outcome::Err(message) => Err(anyhow!(message)),
        }
    }
}

async fn log_stats(statistics: &dyn Statistics) {
    match statistics.get_stats().await {
        Ok(stats) => info!("statistics:\n{stats}"),
        Err(err) => debug!(%err, "failed to fetch statistics"),
    }
}

/// Removes a cancelled job's queued tasks.
struct Cancellation {
    job_id: JobId,
    tasks: Arc<dyn Queue<Task>>,
    statistics: Arc<dyn Statistics>,
    finished_jobs: Arc<Mutex<FinishedJobs>>,
}

impl Cancellation {
    async fn run(self) -> Result<()> {
        debug!(job_id = %self.job_id, "parallel processing cancelled");
        self.finished_jobs.lock().await.insert(self.job_id);

        // Visit every task queued right now exactly once.
        let queued = self.tasks.qsize().await?;
        let mut removed = 0;
        for _ in 0..queued {
            let task = match self.tasks.get(DRAIN_TIMEOUT).await {
                Ok(task) => task,
                Err(BrokerError::Timeout) => break,
                Err(err) => return Err(err.into()),
            };
            if task.job_id == self.job_id {
                removed += 1;
            } else {
                self.tasks.put(task).await?;
            }
        }
        if removed > 0 {
            debug!(job_id = %self.job_id, removed, "removed remaining tasks");
        }

        log_stats(self.statistics.as_ref()).await;
        Ok(())
    }
}

/// The results of one submitted batch.
///
/// Yields one item per argument tuple: the decoded output, or the error the
/// task failed with. A batch abandoned before its last result should be
/// [`cancel`](Self::cancel)led so its queued tasks are removed. Dropping an
/// unfinished stream schedules the same clean-up on the current tokio
/// runtime.
#[pin_project(PinnedDrop)]
pub struct JobStream<O> {
    inner: BoxStream<'static, Result<O>>,
    cancellation: Option<Cancellation>,
}

impl<O> JobStream<O> {
    fn new(inner: BoxStream<'static, Result<O>>, cancellation: Option<Cancellation>) -> Self {
        Self {
            inner,
            cancellation,
        }
    }

    /// The job id, for batches submitted to a manager.
    pub fn job_id(&self) -> Option<JobId> {
        self.cancellation
            .as_ref()
            .map(|cancellation| cancellation.job_id)
    }

    /// Abandon the batch: remember it as finished, so its late results are
    /// discarded by every submitter, and remove its queued tasks.
    pub async fn cancel(mut self) -> Result<()> {
        match self.cancellation.take() {
            Some(cancellation) => cancellation.run().await,
            None => Ok(()),
        }
    }
}

impl<O> Stream for JobStream<O> {
    type Item = Result<O>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let next = futures::ready!(this.inner.poll_next_unpin(cx));
        if next.is_none() {
            // Nothing left to clean up.
            this.cancellation.take();
        }
        Poll::Ready(next)
    }
}

#[pinned_drop]
impl<O> PinnedDrop for JobStream<O> {
    fn drop(self: Pin<&mut Self>) {
        let Some(cancellation) = self.project().cancellation.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let job_id = cancellation.job_id;
                    if let Err(err) = cancellation.run().await {
                        warn!(%job_id, %err, "failed to clean up a dropped job");
                    }
                });
            }
            Err(_) => warn!(
                job_id = %cancellation.job_id,
                "job dropped outside a tokio runtime, its queued tasks are left behind"
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::operation::Result as OpResult;

    #[derive(Serialize, Deserialize, crate::RemoteExecute)]
    #[spindle(internal)]
    struct Lift(f64);

    impl Operation for Lift {
        type Input = (f64,);
        type Output = f64;

        fn execute(&self, (z,): Self::Input) -> OpResult<Self::Output> {
            Ok(z + self.0)
        }
    }

    fn result(job_id: JobId, value: f64, requeues: u32) -> TaskResult {
        TaskResult {
            job_id,
            index: 0,
            outcome: Outcome::Ok(Serializer::Postcard.to_bytes(&value).unwrap()),
            requeues,
        }
    }

    fn collector(
        manager: &Manager,
        job_id: JobId,
        finished_jobs: &Arc<Mutex<FinishedJobs>>,
        shutdown: CancellationToken,
    ) -> Collector<f64> {
        Collector {
            job_id,
            total: 1,
            yielded: 0,
            next_index: 0,
            pending: BTreeMap::new(),
            unordered: false,
            results: manager.results(),
            statistics: manager.statistics(),
            closing: manager.flag("closing"),
            shutdown,
            finished_jobs: finished_jobs.clone(),
            serializer: Serializer::Postcard,
            _output: PhantomData,
        }
    }

    #[test]
    fn finished_jobs_evict_the_oldest() {
        let mut finished = FinishedJobs::new();
        let jobs: Vec<_> = (0..12).map(|_| JobId::new()).collect();
        for job in &jobs {
            finished.insert(*job);
        }

        assert_eq!(finished.len(), FINISHED_JOBS_CAPACITY);
        assert!(!finished.contains(&jobs[0]));
        assert!(!finished.contains(&jobs[1]));
        assert!(jobs[2..].iter().all(|job| finished.contains(job)));
    }

    #[tokio::test]
    async fn cancellation_only_removes_its_own_tasks() {
        let manager = Manager::local();
        let finished = Arc::new(Mutex::new(FinishedJobs::new()));
        let (mine, theirs) = (JobId::new(), JobId::new());
        for index in 0..6 {
            let job_id = if index % 2 == 0 { mine } else { theirs };
            manager
                .tasks()
                .put(Task {
                    job_id,
                    index,
                    operation: "geometry::Waterline".into(),
                    op: Bytes::new(),
                    args: vec![],
                    serializer: Serializer::Postcard,
                })
                .await
                .unwrap();
        }

        let cancellation = Cancellation {
            job_id: mine,
            tasks: manager.tasks(),
            statistics: manager.statistics(),
            finished_jobs: finished.clone(),
        };
        cancellation.run().await.unwrap();

        assert!(finished.lock().await.contains(&mine));
        let mut left = vec![];
        while let Ok(task) = manager.tasks().get(DRAIN_TIMEOUT).await {
            left.push((task.job_id, task.index));
        }
        assert_eq!(left, [(theirs, 1), (theirs, 3), (theirs, 5)]);
    }

    #[tokio::test]
    async fn stray_results_are_discarded_dropped_or_put_back() {
        let manager = Manager::local();
        let finished = Arc::new(Mutex::new(FinishedJobs::new()));
        let (mine, cancelled, abandoned, other) =
            (JobId::new(), JobId::new(), JobId::new(), JobId::new());
        finished.lock().await.insert(cancelled);

        let results = manager.results();
        for stray in [
            result(cancelled, 1.0, 0),
            result(abandoned, 2.0, MAX_REQUEUES),
            result(other, 3.0, 0),
            result(mine, 4.0, 0),
        ] {
            results.put(stray).await.unwrap();
        }

        let mut collector = collector(&manager, mine, &finished, CancellationToken::new());
        assert_eq!(collector.next().await.unwrap().unwrap(), 4.0);
        assert!(collector.next().await.is_none());

        // Only the result of a live job survives, one requeue older.
        let left = results.get(DRAIN_TIMEOUT).await.unwrap();
        assert_eq!((left.job_id, left.requeues), (other, 1));
        assert!(results.empty().await.unwrap());
    }

    #[tokio::test]
    async fn collector_gives_up_once_its_runtime_shuts_down() {
        let manager = Manager::local();
        let finished = Arc::new(Mutex::new(FinishedJobs::new()));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let mut collector = collector(&manager, JobId::new(), &finished, shutdown);
        let err = collector.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("shutting down"), "{err}");
        assert!(collector.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_an_unfinished_stream_cleans_up() {
        let manager = Manager::local();
        let finished = Arc::new(Mutex::new(FinishedJobs::new()));
        let closing = manager.flag("closing");
        let shutdown = CancellationToken::new();
        let submitter = Submitter {
            manager: &manager,
            closing: &closing,
            shutdown: &shutdown,
            source_id: "submitter",
            finished_jobs: &finished,
            serializer: Serializer::Postcard,
        };

        let heights = [0.0, 1.0, 2.0, 3.0, 4.0];
        let mut stream = submitter
            .submit(&Lift(0.5), heights.iter().map(|z| vec![Arg::value(z)]), false)
            .await
            .unwrap();
        let job_id = stream.job_id().unwrap();
        assert_eq!(manager.tasks().qsize().await.unwrap(), 5);

        // Work off the first two tasks by hand.
        for _ in 0..2 {
            let task = manager.tasks().get(DRAIN_TIMEOUT).await.unwrap();
            let args: Vec<Bytes> = task
                .args
                .iter()
                .map(|arg| match arg {
                    Argument::Value(value) => value.clone(),
                    Argument::Cached(key) => panic!("unexpected cached argument {key}"),
                })
                .collect();
            let output = execute_registered::<Lift>(task.serializer, &task.op, &args).unwrap();
            manager
                .results()
                .put(TaskResult::new(&task, Outcome::Ok(output)))
                .await
                .unwrap();
        }

        assert_eq!(stream.next().await.unwrap().unwrap(), 0.5);
        assert_eq!(stream.next().await.unwrap().unwrap(), 1.5);
        drop(stream);

        // The clean-up runs on a spawned task.
        for _ in 0..100 {
            if finished.lock().await.contains(&job_id) && manager.tasks().empty().await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished.lock().await.contains(&job_id));
        assert!(manager.tasks().empty().await.unwrap());
    }
}
