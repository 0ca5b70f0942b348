//! plughost: supervisor for out-of-process plugin hosts.

mod exit;
mod supervisor;

pub mod bridge;
pub mod config;
pub mod env;
pub mod process_tree;
pub mod termination;
pub mod worker;

pub use config::{CommandSpawner, SpawnError, SupervisorConfig, WorkerLaunch, WorkerSpawner};
pub use env::{EnvContributor, Environment, EnvironmentBuilder, LocalizationConfig};
pub use exit::{CrashCause, ExitEvent, ExitStatusInfo};
pub use process_tree::{KillError, KillReport, ProcessKiller, ProcessTreeLookup};
pub use supervisor::{ClientSink, ExitListener, PluginHostSupervisor, SupervisorError};
pub use termination::TerminationState;
pub use worker::{HostSender, WorkerHandler, run_worker};
