//! The runtime: one process's view of the engine.
//!
//! A [`Runtime`] is built once from a [`Config`] and decides how batches
//! submitted through [`Runtime::run_in_parallel`] are executed:
//!
//! - **Disabled**: sequentially in the calling process. Chosen when only one
//!   core is available, or when `worker_count` is zero and no manager is used.
//! - **Local**: on an in-process pool of `worker_count` blocking executors.
//! - **Managed**: through a [`Manager`], hosted by this process or joined on
//!   another host. A [`Spawner`](spawner::Spawner) launches this process's
//!   workers whenever tasks are pending, and results travel back through the
//!   manager's result queue.
//!
//! # Semantic overview
//!
//! - [`Operation`]: the computation, a pure function of its input.
//! - [`Task`](crate::task::Task): one invocation of an operation on one
//!   argument tuple. The payload workers consume.
//! - [`JobStream`]: the results of one batch, in submission order unless
//!   requested otherwise.
//!
//! Each runtime owns a source id. It names the runtime's queueing statistics
//! and its closing flag on the manager, so [`Runtime::shutdown`] stops the
//! workers this runtime started and nobody else's.
use std::{
    net::{IpAddr, Ipv4Addr},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use futures::lock::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::{
    spawner::{InProcessLauncher, ProcessLauncher, Spawner, SpawnerState, WorkerLauncher},
    submission::{encode_inline, run_local, Submitter},
    worker::WorkerOptions,
};
use crate::{
    broker::{flag::Flag, Manager},
    config::{Config, RemoteAddress},
    error::BrokerError,
    operation::Operation,
    serializer::Serializer,
    task::Arg,
};

pub mod spawner;
pub mod submission;
pub mod worker;

pub use submission::{FinishedJobs, JobStream, RunOptions};

fn available_cores() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

struct Managed {
    manager: Manager,
    closing: Flag,
    worker_count: usize,
    spawner: Option<JoinHandle<Result<SpawnerState>>>,
    shutdown_grace: Duration,
}

impl Managed {
    async fn start(
        config: &Config,
        remote: Option<&RemoteAddress>,
        worker_count: usize,
        source_id: &str,
        token: &CancellationToken,
    ) -> Result<Self> {
        let serializer = Serializer::from(config);
        info!(worker_count, "enabled parallel processes, allowing remote processing");

        let manager = match remote {
            Some(address) => Manager::connect(address, &config.credentials, serializer).await?,
            None => {
                let address = RemoteAddress {
                    host: config.listen_host.clone(),
                    port: config.listen_port,
                };
                Manager::host(&address, &config.credentials, serializer).await?
            }
        };

        let closing = manager.flag(format!("closing-{source_id}"));
        closing.clear().await?;

        let spawner = if worker_count > 0 {
            let launcher = launcher(config, &manager, &closing, token)?;
            let spawner = Spawner::new(manager.tasks(), closing.clone(), launcher, worker_count);
            Some(tokio::spawn(spawner.run(token.child_token())))
        } else {
            None
        };

        Ok(Self {
            manager,
            closing,
            worker_count,
            spawner,
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        })
    }

    async fn shutdown(self, token: &CancellationToken) -> Result<()> {
        debug!("shutting down process handler");
        let flagged = self.closing.set().await;

        if let Some(mut spawner) = self.spawner {
            match tokio::time::timeout(self.shutdown_grace, &mut spawner).await {
                Ok(Ok(Ok(state))) => debug!(?state, "spawner finished"),
                Ok(Ok(Err(err))) => warn!(%err, "spawner failed"),
                Ok(Err(err)) => warn!(%err, "spawner panicked"),
                Err(_) => {
                    warn!("workers did not stop in time, aborting them");
                    token.cancel();
                    let _ = spawner.await;
                }
            }
        }
        token.cancel();

        // Nothing observes the flag anymore.
        let removed = self.closing.remove().await;

        // Only a hosting manager stops serving, clients just disconnect.
        self.manager.shutdown().await;
        flagged.and(removed).map_err(Into::into)
    }
}

/// Pick how workers are launched: as OS processes when a worker program is
/// configured, as tokio tasks otherwise.
fn launcher(
    config: &Config,
    manager: &Manager,
    closing: &Flag,
    token: &CancellationToken,
) -> Result<Arc<dyn WorkerLauncher>> {
    let Some(program) = &config.worker_program else {
        let options = WorkerOptions {
            idle_limit: config.worker_idle_limit,
            ..Default::default()
        };
        return Ok(Arc::new(InProcessLauncher::new(
            manager.handles(),
            closing.clone(),
            options,
            token.child_token(),
        )));
    };

    let address = match (manager.remote_address(), manager.local_addr()) {
        (Some(address), _) => address.clone(),
        (None, Some(local)) => {
            let ip = if local.ip().is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                local.ip()
            };
            RemoteAddress {
                host: ip.to_string(),
                port: local.port(),
            }
        }
        (None, None) => {
            return Err(BrokerError::Configuration(
                "worker processes need a manager they can connect to".into(),
            )
            .into())
        }
    };

    Ok(Arc::new(ProcessLauncher {
        program: program.clone(),
        address,
        credentials: config.credentials.clone(),
        serializer: Serializer::from(config),
        closing: closing.name().to_string(),
        idle_limit: config.worker_idle_limit,
    }))
}

enum Mode {
    Disabled,
    Local { worker_count: usize },
    Managed(Managed),
}

/// The engine as seen by one process.
///
/// Built with [`Runtime::init`], torn down with [`Runtime::shutdown`].
/// Dropping a runtime without shutting it down aborts its workers.
pub struct Runtime {
    mode: Mode,
    serializer: Serializer,
    source_id: String,
    finished_jobs: Arc<Mutex<FinishedJobs>>,
    token: CancellationToken,
}

impl Runtime {
    /// Initialize the runtime.
    ///
    /// Remote settings are ignored unless `enable_server` or
    /// `run_as_server_only` is set. Without `worker_count`, one worker per
    /// core is used, except on a single core machine without a manager where
    /// parallel processing is disabled. A `worker_count` of zero disables
    /// parallel processing unless a manager is involved: a process may host
    /// or join a manager without contributing workers.
    pub async fn init(config: &Config) -> Result<Self> {
        let serializer = Serializer::from(config);
        let serving = config.enable_server || config.run_as_server_only;
        let remote = match &config.remote_address {
            Some(address) if serving => Some(RemoteAddress::parse(address)),
            _ => None,
        };
        if config.run_as_server_only && remote.is_some() {
            return Err(BrokerError::Configuration(
                "run_as_server_only hosts a manager and cannot join the one at remote_address"
                    .into(),
            )
            .into());
        }

        let cores = available_cores();
        let worker_count = match config.worker_count {
            None if config.run_as_server_only => Some(0),
            None if cores > 1 || remote.is_some() => Some(cores),
            None => None,
            Some(0) if remote.is_none() && !config.run_as_server_only => None,
            Some(count) => Some(count),
        };

        let source_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let mode = match worker_count {
            None => {
                info!("disabled parallel processing");
                Mode::Disabled
            }
            Some(worker_count) if !serving => {
                info!(worker_count, "enabled parallel local processes");
                Mode::Local { worker_count }
            }
            Some(worker_count) => Mode::Managed(
                Managed::start(config, remote.as_ref(), worker_count, &source_id, &token).await?,
            ),
        };

        Ok(Self {
            mode,
            serializer,
            source_id,
            finished_jobs: Default::default(),
            token,
        })
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Names this runtime's queueing statistics and closing flag.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Workers this runtime runs, zero when parallel processing is disabled.
    pub fn worker_count(&self) -> usize {
        match &self.mode {
            Mode::Disabled => 0,
            Mode::Local { worker_count } => *worker_count,
            Mode::Managed(managed) => managed.worker_count,
        }
    }

    pub fn is_parallel(&self) -> bool {
        !matches!(self.mode, Mode::Disabled)
    }

    pub fn manager(&self) -> Option<&Manager> {
        match &self.mode {
            Mode::Managed(managed) => Some(&managed.manager),
            _ => None,
        }
    }

    /// Apply `op` to every argument tuple of `batches`.
    ///
    /// With a manager, arguments passed as [`Arg::shared`] are uploaded to
    /// the manager's cache once per batch (unless already present) and sent
    /// by reference. The returned stream yields one result per tuple.
    ///
    /// ```
    /// use futures::StreamExt;
    /// use serde::{Deserialize, Serialize};
    /// use spindle::{
    ///     config::Config,
    ///     operation::{Operation, Result},
    ///     runtime::{RunOptions, Runtime},
    ///     task::Arg,
    ///     RemoteExecute,
    /// };
    ///
    /// #[derive(Serialize, Deserialize, RemoteExecute)]
    /// struct SegmentLength;
    ///
    /// impl Operation for SegmentLength {
    ///     type Input = ((f64, f64), (f64, f64));
    ///     type Output = f64;
    ///
    ///     fn execute(&self, ((x1, y1), (x2, y2)): Self::Input) -> Result<Self::Output> {
    ///         Ok((x2 - x1).hypot(y2 - y1))
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() -> anyhow::Result<()> {
    /// let runtime = Runtime::init(&Config::default()).await?;
    /// let origin = (0.0, 0.0);
    /// let ends = [(3.0, 4.0), (6.0, 8.0)];
    ///
    /// let mut lengths = runtime
    ///     .run_in_parallel(
    ///         &SegmentLength,
    ///         ends.iter().map(|end| vec![Arg::value(&origin), Arg::value(end)]),
    ///         RunOptions::default(),
    ///     )
    ///     .await?;
    ///
    /// assert_eq!(lengths.next().await.transpose()?, Some(5.0));
    /// assert_eq!(lengths.next().await.transpose()?, Some(10.0));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_in_parallel<'a, Op, I>(
        &self,
        op: &Op,
        batches: I,
        options: RunOptions,
    ) -> Result<JobStream<Op::Output>>
    where
        Op: Operation,
        I: IntoIterator<Item = Vec<Arg<'a>>>,
    {
        let serializer = self.serializer;
        match &self.mode {
            Mode::Managed(managed) if !options.disable_parallelism => {
                let submitter = Submitter {
                    manager: &managed.manager,
                    closing: &managed.closing,
                    shutdown: &self.token,
                    source_id: &self.source_id,
                    finished_jobs: &self.finished_jobs,
                    serializer,
                };
                submitter.submit(op, batches, options.unordered).await
            }
            Mode::Local { worker_count } if !options.disable_parallelism => run_local(
                op,
                encode_inline(batches, serializer)?,
                serializer,
                *worker_count,
                options.unordered,
            ),
            _ => run_local(op, encode_inline(batches, serializer)?, serializer, 1, false),
        }
    }

    /// Block until interrupted (Ctrl-C) or until this runtime's closing flag
    /// is set. Used by processes that only serve a manager.
    pub async fn serve_forever(&self) -> Result<()> {
        let closing = match &self.mode {
            Mode::Managed(managed) => {
                info!("running a manager and waiting for remote connections");
                Some(&managed.closing)
            }
            _ => None,
        };

        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);
        loop {
            tokio::select! {
                signal = &mut interrupted => {
                    signal?;
                    info!("interrupted, stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(spawner::POLL_INTERVAL) => {
                    if let Some(closing) = closing {
                        if closing.is_set().await? {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Set the closing flag, give the workers a grace period to stop and,
    /// when hosting, stop serving the manager.
    pub async fn shutdown(mut self) -> Result<()> {
        match std::mem::replace(&mut self.mode, Mode::Disabled) {
            Mode::Managed(managed) => managed.shutdown(&self.token).await,
            _ => Ok(()),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod test {
    use futures::{StreamExt, TryStreamExt};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        broker::{server::Server, Resources},
        cache::{Cache, CacheRef, Cacheable},
        operation::{OperationError, Result as OpResult},
        statistics::Statistics,
    };

    /// Height of a flat-bottom cutter at `x` over a sampled profile.
    #[derive(Serialize, Deserialize, crate::RemoteExecute)]
    #[spindle(internal)]
    struct ProfileHeight {
        clearance: f64,
        delay_ms: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Profile {
        id: String,
        heights: Vec<f64>,
    }

    impl Cacheable for Profile {
        fn cache_ref(&self) -> CacheRef {
            CacheRef::new(&self.id)
        }
    }

    impl Operation for ProfileHeight {
        type Input = (Profile, usize);
        type Output = f64;

        fn execute(&self, (profile, x): Self::Input) -> OpResult<Self::Output> {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            profile
                .heights
                .get(x)
                .map(|z| z + self.clearance)
                .ok_or_else(|| OperationError::fatal_str("outside the profile"))
        }
    }

    fn profile(len: usize) -> Profile {
        Profile {
            id: format!("profile-{len}"),
            heights: (0..len).map(|x| x as f64).collect(),
        }
    }

    fn op(delay_ms: u64) -> ProfileHeight {
        ProfileHeight {
            clearance: 0.5,
            delay_ms,
        }
    }

    fn host_config(worker_count: Option<usize>) -> Config {
        Config {
            worker_count,
            enable_server: true,
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            worker_idle_limit: 2,
            shutdown_grace_ms: 500,
            ..Default::default()
        }
    }

    fn port(runtime: &Runtime) -> u16 {
        runtime
            .manager()
            .and_then(Manager::local_addr)
            .map(|addr| addr.port())
            .unwrap()
    }

    async fn collect(
        runtime: &Runtime,
        profile: &Profile,
        xs: &[usize],
        options: RunOptions,
    ) -> Vec<f64> {
        runtime
            .run_in_parallel(
                &op(0),
                xs.iter().map(|x| vec![Arg::shared(profile), Arg::value(x)]),
                options,
            )
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn disabled_runtime_runs_sequentially_in_order() {
        let runtime = Runtime::init(&Config {
            worker_count: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(!runtime.is_parallel());
        assert!(runtime.manager().is_none());

        let heights = collect(&runtime, &profile(5), &[4, 3, 2, 1, 0], RunOptions::default()).await;
        assert_eq!(heights, [4.5, 3.5, 2.5, 1.5, 0.5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn local_pool_preserves_order_unless_asked_not_to() {
        let runtime = Runtime::init(&Config {
            worker_count: Some(4),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(runtime.worker_count(), 4);

        let xs: Vec<usize> = (0..20).rev().collect();
        let profile = profile(20);
        let ordered = collect(&runtime, &profile, &xs, RunOptions::default()).await;
        let expected: Vec<f64> = xs.iter().map(|x| *x as f64 + 0.5).collect();
        assert_eq!(ordered, expected);

        let unordered = RunOptions {
            unordered: true,
            ..Default::default()
        };
        let mut any_order = collect(&runtime, &profile, &xs, unordered).await;
        any_order.sort_by(f64::total_cmp);
        let mut sorted = expected.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(any_order, sorted);
    }

    #[tokio::test]
    async fn failed_tasks_are_reported_in_place() {
        let runtime = Runtime::init(&Config {
            worker_count: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
        let profile = profile(2);
        let xs = [0_usize, 7, 1];

        let results: Vec<_> = runtime
            .run_in_parallel(
                &op(0),
                xs.iter().map(|x| vec![Arg::value(&profile), Arg::value(x)]),
                RunOptions::default(),
            )
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &0.5);
        assert!(results[1]
            .as_ref()
            .unwrap_err()
            .to_string()
            .contains("outside the profile"));
        assert_eq!(results[2].as_ref().unwrap(), &1.5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn managed_runtime_distributes_to_its_workers() {
        let runtime = Runtime::init(&host_config(Some(2))).await.unwrap();
        assert!(runtime.manager().unwrap().is_host());

        let profile = profile(6);
        let heights = collect(&runtime, &profile, &[5, 0, 3], RunOptions::default()).await;
        assert_eq!(heights, [5.5, 0.5, 3.5]);

        let manager = runtime.manager().unwrap();
        assert!(manager.cache().contains(&profile.cache_ref()).await.unwrap());
        let stats = manager.statistics().get_stats().await.unwrap();
        assert!(stats.contains(&format!("Queue {}: ", runtime.source_id())), "{stats}");

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn abandoned_batch_does_not_leak_into_the_next() {
        let runtime = Runtime::init(&host_config(Some(2))).await.unwrap();
        let profile = profile(5);
        let xs = [0_usize, 1, 2, 3, 4];

        let mut first = runtime
            .run_in_parallel(
                &op(50),
                xs.iter().map(|x| vec![Arg::shared(&profile), Arg::value(x)]),
                RunOptions::default(),
            )
            .await
            .unwrap();
        let first_id = first.job_id().unwrap();
        assert_eq!(first.next().await.unwrap().unwrap(), 0.5);
        assert_eq!(first.next().await.unwrap().unwrap(), 1.5);
        first.cancel().await.unwrap();
        assert!(runtime.finished_jobs.lock().await.contains(&first_id));

        let shifted: Vec<usize> = xs.iter().map(|x| 4 - x).collect();
        let second = collect(&runtime, &profile, &shifted, RunOptions::default()).await;
        assert_eq!(second, [4.5, 3.5, 2.5, 1.5, 0.5]);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_receive_their_own_results() {
        let runtime = Runtime::init(&host_config(Some(3))).await.unwrap();
        let profile = profile(8);
        let unordered = RunOptions {
            unordered: true,
            ..Default::default()
        };

        let (mut a, mut b) = tokio::join!(
            collect(&runtime, &profile, &[0, 1, 2, 3], unordered),
            collect(&runtime, &profile, &[4, 5, 6, 7], unordered),
        );
        a.sort_by(f64::total_cmp);
        b.sort_by(f64::total_cmp);
        assert_eq!(a, [0.5, 1.5, 2.5, 3.5]);
        assert_eq!(b, [4.5, 5.5, 6.5, 7.5]);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn remote_workers_serve_a_hosting_runtime() {
        let host = Runtime::init(&Config {
            run_as_server_only: true,
            credentials: "mill".into(),
            ..host_config(None)
        })
        .await
        .unwrap();
        assert_eq!(host.worker_count(), 0);

        let client = Runtime::init(&Config {
            worker_count: Some(2),
            enable_server: true,
            remote_address: Some(format!("127.0.0.1:{}", port(&host))),
            credentials: "mill".into(),
            worker_idle_limit: 2,
            shutdown_grace_ms: 500,
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(client.manager().unwrap().remote_address().is_some());

        let profile = profile(4);
        let heights = collect(&host, &profile, &[3, 2, 1], RunOptions::default()).await;
        assert_eq!(heights, [3.5, 2.5, 1.5]);

        // The client's shutdown stops its own workers only.
        let host_closing = host.manager().unwrap().flag(format!("closing-{}", host.source_id()));
        client.shutdown().await.unwrap();
        assert!(!host_closing.is_set().await.unwrap());

        host.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_removes_the_closing_flag() {
        let resources = Resources::default();
        let address = RemoteAddress {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let server = Server::bind(&address, "", Serializer::Postcard, resources.clone())
            .await
            .unwrap();

        let client = Runtime::init(&Config {
            worker_count: Some(0),
            enable_server: true,
            remote_address: Some(format!("127.0.0.1:{}", server.local_addr().port())),
            shutdown_grace_ms: 500,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(resources.flags.len(), 1);

        client.shutdown().await.unwrap();
        assert!(resources.flags.is_empty());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn serving_only_cannot_join_another_manager() {
        let result = Runtime::init(&Config {
            run_as_server_only: true,
            remote_address: Some("10.0.0.1".into()),
            ..Default::default()
        })
        .await;

        let err = result.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<BrokerError>(),
            Some(BrokerError::Configuration(_))
        ));
    }
}
