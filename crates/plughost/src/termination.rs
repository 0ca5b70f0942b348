//! Graceful-then-forceful worker termination.
//!
//! 1. Send `TerminateRequest` carrying the soft deadline
//! 2. Race the worker's `TerminatedEvent` against the hard escalation timer
//!    (an exit of the worker also ends the wait)
//! 3. If the worker is still alive, kill its whole process tree
//! 4. Wait (bounded) for the OS to report the exit

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};

use crate::bridge::protocol::HostMessage;
use crate::exit::ExitStatusInfo;
use crate::process_tree::{KillReport, ProcessKiller, ProcessTreeLookup, kill_process_tree};

/// Lifecycle of a single worker launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationTimeouts {
    /// Soft deadline advertised to the worker for its own cleanup.
    pub stop: Duration,
    /// Hard escalation: how long to wait for the acknowledgement.
    pub terminate: Duration,
    /// How long to wait for the OS to report an exit (after ack or kill).
    pub exit_wait: Duration,
}

/// How the wait for the worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Worker sent `TerminatedEvent`.
    Acknowledged,
    /// Worker exited without acknowledging.
    Exited,
    /// Hard escalation timer fired.
    TimedOut,
    /// No channel to deliver the request on.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    pub outcome: HandshakeOutcome,
    /// Present only if the process tree had to be killed.
    pub kill: Option<KillReport>,
}

/// Handles onto a running worker that the handshake needs.
pub struct WorkerHandles<'a> {
    pub pid: u32,
    pub outbound: Option<mpsc::UnboundedSender<HostMessage>>,
    pub acknowledged: &'a Notify,
    pub exit: watch::Receiver<Option<ExitStatusInfo>>,
}

fn has_exited(exit: &watch::Receiver<Option<ExitStatusInfo>>) -> bool {
    exit.borrow().is_some()
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitStatusInfo>>, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, exit.wait_for(Option::is_some)).await,
        Ok(Ok(_))
    )
}

/// Run the termination protocol against one worker.
pub async fn terminate_worker(
    worker: WorkerHandles<'_>,
    timeouts: TerminationTimeouts,
    tree: Arc<dyn ProcessTreeLookup>,
    killer: Arc<dyn ProcessKiller>,
) -> TerminationReport {
    let WorkerHandles {
        pid,
        outbound,
        acknowledged,
        mut exit,
    } = worker;

    let timeout_ms = u64::try_from(timeouts.stop.as_millis()).unwrap_or(u64::MAX);
    let delivered = outbound
        .map(|tx| tx.send(HostMessage::TerminateRequest { timeout_ms }).is_ok())
        .unwrap_or(false);

    let outcome = if !delivered {
        tracing::warn!(pid, "Plugin host channel unavailable, skipping graceful stop");
        HandshakeOutcome::Unreachable
    } else if has_exited(&exit) {
        HandshakeOutcome::Exited
    } else {
        tracing::debug!(pid, timeout_ms, "Sent TerminateRequest");
        tokio::select! {
            _ = acknowledged.notified() => HandshakeOutcome::Acknowledged,
            _ = exit.wait_for(Option::is_some) => HandshakeOutcome::Exited,
            _ = tokio::time::sleep(timeouts.terminate) => HandshakeOutcome::TimedOut,
        }
    };
    tracing::debug!(pid, ?outcome, "Termination handshake finished");

    // An acknowledging worker exits on its own; give it the chance.
    if outcome == HandshakeOutcome::Acknowledged && !has_exited(&exit) {
        wait_for_exit(&mut exit, timeouts.exit_wait).await;
    }

    if has_exited(&exit) {
        return TerminationReport {
            outcome,
            kill: None,
        };
    }

    tracing::warn!(pid, ?outcome, "Plugin host still running, killing process tree");
    let kill = match tokio::task::spawn_blocking(move || {
        kill_process_tree(pid, tree.as_ref(), killer.as_ref())
    })
    .await
    {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(pid, error = %e, "Process tree kill task failed");
            KillReport::default()
        }
    };

    if !wait_for_exit(&mut exit, timeouts.exit_wait).await {
        tracing::warn!(pid, "Plugin host did not report exit after kill");
    }

    TerminationReport {
        outcome,
        kill: Some(kill),
    }
}
