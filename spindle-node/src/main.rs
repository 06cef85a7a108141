use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use futures::TryStreamExt;
use spindle::{
    broker::Manager,
    config::{self, Config, RemoteAddress},
    runtime::{
        worker::{Worker, WorkerOptions},
        RunOptions, Runtime,
    },
    serializer::Serializer,
    task::Arg,
};
use spindle_node::ops::{DropCutter, HeightField};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod init;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host or join a manager and serve until interrupted.
    Serve {
        #[command(flatten)]
        options: Config,
    },
    /// Drop a ball-end cutter along one raster line of a demo height field.
    Demo {
        #[command(flatten)]
        options: Config,
        /// Samples along the raster line.
        #[arg(long, default_value_t = 64)]
        samples: usize,
        /// Cutter radius.
        #[arg(long, default_value_t = 1.5)]
        radius: f64,
    },
    /// Run a single worker against a manager. Launched by the spawner.
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Manager to join, `host[:port]`.
    #[arg(long)]
    pub remote_address: String,
    #[arg(long)]
    pub worker_name: String,
    /// Flag that tells the worker to stop.
    #[arg(long)]
    pub closing_flag: String,
    #[arg(long, default_value_t = 60)]
    pub worker_idle_limit: u32,
    #[arg(long, value_enum, default_value_t = config::Serializer::Postcard)]
    pub serializer: config::Serializer,
    #[arg(long, env = "SPINDLE_CREDENTIALS", default_value = "", hide_env_values = true)]
    pub credentials: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();

    match Cli::parse().command {
        Command::Serve { options } => serve(with_process_workers(options)?).await,
        Command::Demo {
            options,
            samples,
            radius,
        } => demo(with_process_workers(options)?, samples, radius).await,
        Command::Worker(args) => worker(args).await,
    }
}

/// Spawned workers run as `spindle-node worker` processes unless another
/// program is configured.
fn with_process_workers(mut options: Config) -> Result<Config> {
    if options.worker_program.is_none() {
        options.worker_program = Some(std::env::current_exe()?);
    }
    Ok(options)
}

async fn serve(options: Config) -> Result<()> {
    let runtime = Runtime::init(&options).await?;
    if let Some(addr) = runtime.manager().and_then(Manager::local_addr) {
        info!(%addr, "manager listening");
    }
    runtime.serve_forever().await?;
    runtime.shutdown().await
}

async fn demo(options: Config, samples: usize, radius: f64) -> Result<()> {
    let runtime = Runtime::init(&options).await?;
    let field = HeightField::ridge("demo", 128, 32, 0.25);
    let y = field.rows() as f64 * field.spacing / 2.0;
    let width = (field.columns - 1) as f64 * field.spacing;
    let points: Vec<(f64, f64)> = (0..samples)
        .map(|i| (width * i as f64 / samples.max(2).saturating_sub(1) as f64, y))
        .collect();

    let heights: Vec<f64> = runtime
        .run_in_parallel(
            &DropCutter { radius },
            points
                .iter()
                .map(|point| vec![Arg::shared(&field), Arg::value(point)]),
            RunOptions::default(),
        )
        .await?
        .try_collect()
        .await?;

    for ((x, y), z) in points.iter().zip(&heights) {
        info!("({x:.3}, {y:.3}) -> {z:.4}");
    }
    runtime.shutdown().await
}

async fn worker(args: WorkerArgs) -> Result<()> {
    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupted, stopping worker");
                    token.cancel();
                }
                Err(err) => warn!(%err, "cannot listen for interrupts"),
            }
        }
    });

    let serializer = Serializer::from(args.serializer);
    let address = RemoteAddress::parse(&args.remote_address);
    let manager = Manager::connect(&address, &args.credentials, serializer).await?;
    let options = WorkerOptions {
        idle_limit: args.worker_idle_limit,
        ..Default::default()
    };

    Worker::new(
        args.worker_name,
        manager.handles(),
        manager.flag(args.closing_flag),
        options,
    )
    .run(token)
    .await
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn workers_default_to_this_executable() {
        let options = with_process_workers(Config::default()).unwrap();
        assert_eq!(options.worker_program, Some(std::env::current_exe().unwrap()));

        let custom = Config {
            worker_program: Some(PathBuf::from("/opt/mill/worker")),
            ..Default::default()
        };
        let options = with_process_workers(custom).unwrap();
        assert_eq!(options.worker_program, Some(PathBuf::from("/opt/mill/worker")));
    }
}
