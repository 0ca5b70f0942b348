//! Supervisor configuration and the worker spawn extension point.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::env::Environment;
use crate::process_tree::{ProcessKiller, ProcessTreeLookup, SignalKiller, SysinfoProcessTree};
use crate::termination::TerminationTimeouts;

/// Overrides the soft stop deadline, in milliseconds.
pub const STOP_TIMEOUT_ENV: &str = "PLUGIN_HOST_STOP_TIMEOUT";
/// Overrides the hard escalation deadline, in milliseconds.
pub const TERMINATE_TIMEOUT_ENV: &str = "PLUGIN_HOST_TERMINATE_TIMEOUT";

/// Everything needed to launch one worker process.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub program: PathBuf,
    /// Exec args, inspector flags, then the endpoint name last.
    pub args: Vec<String>,
    /// Complete environment; nothing else is inherited.
    pub env: Environment,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have piped stdout/stderr if its output should be
/// forwarded to the supervisor's log.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError>;
}

/// Spawns the worker as a plain subprocess.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError> {
        let child = Command::new(&launch.program)
            .args(&launch.args)
            .env_clear()
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child)
    }
}

/// Inspector flags are plain ASCII, so arguments that are not valid Unicode
/// can never match and are dropped.
fn unicode_args(args: impl IntoIterator<Item = OsString>) -> Vec<String> {
    args.into_iter()
        .filter_map(|arg| arg.into_string().ok())
        .collect()
}

pub struct SupervisorConfig {
    pub program: PathBuf,
    /// Arguments placed before the inspector flags and endpoint name.
    pub exec_args: Vec<String>,
    /// Used for log prefixes and to match `--{server_name}-inspect`.
    pub server_name: String,
    /// Source id handed to the client sink with every relayed message.
    pub source_id: String,
    pub stop_timeout: Duration,
    pub terminate_timeout: Duration,
    pub connect_timeout: Duration,
    pub exit_wait: Duration,
    /// The supervisor's own launch arguments, scanned for inspector flags.
    pub supervisor_args: Vec<String>,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub process_tree: Arc<dyn ProcessTreeLookup>,
    pub killer: Arc<dyn ProcessKiller>,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            exec_args: Vec::new(),
            server_name: "hosted-plugin".to_string(),
            source_id: "main".to_string(),
            stop_timeout: Duration::from_secs(4),
            terminate_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(60),
            exit_wait: Duration::from_secs(5),
            supervisor_args: unicode_args(std::env::args_os()),
            spawner: Arc::new(CommandSpawner),
            process_tree: Arc::new(SysinfoProcessTree),
            killer: Arc::new(SignalKiller),
        }
    }

    /// Like [`SupervisorConfig::new`], with timeout overrides read from the
    /// process environment.
    pub fn from_env(program: impl Into<PathBuf>) -> Self {
        Self::new(program).with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str| -> Option<Duration> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(e) => {
                    tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid timeout override");
                    None
                }
            }
        };
        if let Some(timeout) = millis(STOP_TIMEOUT_ENV) {
            self.stop_timeout = timeout;
        }
        if let Some(timeout) = millis(TERMINATE_TIMEOUT_ENV) {
            self.terminate_timeout = timeout;
        }
        self
    }

    pub fn with_exec_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exec_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_source_id(mut self, id: impl Into<String>) -> Self {
        self.source_id = id.into();
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_exit_wait(mut self, timeout: Duration) -> Self {
        self.exit_wait = timeout;
        self
    }

    pub fn with_supervisor_args(mut self, args: Vec<String>) -> Self {
        self.supervisor_args = args;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_process_tree(mut self, lookup: Arc<dyn ProcessTreeLookup>) -> Self {
        self.process_tree = lookup;
        self
    }

    pub fn with_killer(mut self, killer: Arc<dyn ProcessKiller>) -> Self {
        self.killer = killer;
        self
    }

    pub fn timeouts(&self) -> TerminationTimeouts {
        TerminationTimeouts {
            stop: self.stop_timeout,
            terminate: self.terminate_timeout,
            exit_wait: self.exit_wait,
        }
    }
}
