//! Runtime configuration.
//!
//! [`Config`] carries [`clap`] attributes so binaries can flatten it into
//! their own command line, and it implements [`Default`] so libraries and
//! tests can build one in code. It is handed to
//! [`Runtime::init`](crate::runtime::Runtime::init), which derives the
//! parallelism mode and the manager role from it.
//!
//! The recognised options mirror the deployment shapes of the engine:
//! - nothing set: local parallelism with one worker per detected core;
//! - `enable_server`: host a manager that remote clients may join;
//! - `enable_server` + `remote_address`: join an existing manager instead;
//! - `run_as_server_only`: host a manager with no local workers and serve it
//!   until interrupted.

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use tracing::warn;

/// The port used when none is given, or when the given one is malformed.
pub const DEFAULT_PORT: u16 = 1250;

const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
const DEFAULT_IDLE_LIMIT: u32 = 60;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1500;
const HELP_HEADING: &str = "Spindle options";

/// Represents the main configuration structure for the runtime.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Number of local worker processes. Defaults to the number of detected
    /// cores; zero disables local parallelism unless a remote manager is used.
    #[arg(long, short = 'n', help_heading = HELP_HEADING)]
    pub worker_count: Option<usize>,

    /// Expose the manager of this process to remote clients.
    #[arg(long, help_heading = HELP_HEADING)]
    pub enable_server: bool,

    /// Connect to an existing manager (`host[:port]`) instead of hosting one.
    #[arg(long, short = 'r', help_heading = HELP_HEADING, env = "SPINDLE_REMOTE_ADDRESS")]
    pub remote_address: Option<String>,

    /// Host a manager for remote workers. Local workers are only started
    /// when `worker_count` is given. Cannot be combined with
    /// `remote_address`.
    #[arg(long, help_heading = HELP_HEADING)]
    pub run_as_server_only: bool,

    /// Shared secret presented by clients when connecting to a manager.
    #[arg(long, help_heading = HELP_HEADING, env = "SPINDLE_CREDENTIALS", default_value = "", hide_env_values = true)]
    pub credentials: String,

    /// Interface a hosted manager binds to.
    #[arg(long, help_heading = HELP_HEADING, default_value = DEFAULT_LISTEN_HOST)]
    pub listen_host: String,

    /// Port a hosted manager binds to.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_PORT)]
    pub listen_port: u16,

    /// Determines the serialization format to be used.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Launch workers as `<program> worker ...` processes. Unset, spawned
    /// workers run as tasks of this process.
    #[arg(long, help_heading = HELP_HEADING)]
    pub worker_program: Option<PathBuf>,

    /// Consecutive empty one-second polls after which a worker exits.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_IDLE_LIMIT)]
    pub worker_idle_limit: u32,

    /// Milliseconds to wait for workers to observe shutdown before the
    /// manager stops serving.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_SHUTDOWN_GRACE_MS)]
    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: Default::default(),
            enable_server: Default::default(),
            remote_address: Default::default(),
            run_as_server_only: Default::default(),
            credentials: Default::default(),
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_port: DEFAULT_PORT,
            serializer: Default::default(),
            worker_program: Default::default(),
            worker_idle_limit: DEFAULT_IDLE_LIMIT,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

/// A `(host, port)` pair naming a manager endpoint.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RemoteAddress {
    pub host: String,
    pub port: u16,
}

impl RemoteAddress {
    /// Parse `host[:port]`.
    ///
    /// A missing port selects [`DEFAULT_PORT`]. An unparseable port is not an
    /// error: it is logged and replaced by [`DEFAULT_PORT`].
    pub fn parse(address: &str) -> Self {
        match address.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().unwrap_or_else(|_| {
                    warn!(
                        port,
                        default = DEFAULT_PORT,
                        "invalid port specified, using the default port instead"
                    );
                    DEFAULT_PORT
                });
                Self {
                    host: host.to_string(),
                    port,
                }
            }
            None => Self {
                host: address.to_string(),
                port: DEFAULT_PORT,
            },
        }
    }
}

impl std::fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
