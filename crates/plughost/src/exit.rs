//! Worker exit reporting.

use std::fmt;
use std::process::ExitStatus;

/// Exit code and/or terminating signal as reported by the OS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatusInfo {
    pub code: Option<i32>,
    /// Signal name such as `SIGKILL`.
    pub signal: Option<String>,
}

impl ExitStatusInfo {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    pub fn is_forced_kill(&self) -> bool {
        self.signal
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("SIGKILL"))
    }
}

impl From<ExitStatus> for ExitStatusInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: signal_name(&status),
        }
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let raw = status.signal()?;
    Some(match nix::sys::signal::Signal::try_from(raw) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("signal {raw}"),
    })
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

impl fmt::Display for ExitStatusInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.signal, self.code) {
            (Some(signal), _) => write!(f, "signal {signal}"),
            (None, Some(code)) => write!(f, "exit code {code}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Best guess at why the worker went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashCause {
    /// Killed with SIGKILL, most often the kernel's OOM killer.
    OutOfMemory,
    /// The worker sent a frame that could not be decoded and was shut down.
    ChannelFailure,
    Other,
}

/// Unexpected worker exit, delivered to the `on_exit` listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: u32,
    pub status: ExitStatusInfo,
    pub cause: CrashCause,
}

impl ExitEvent {
    pub fn new(pid: u32, status: ExitStatusInfo, channel_failed: bool) -> Self {
        let cause = if channel_failed {
            CrashCause::ChannelFailure
        } else if status.is_forced_kill() {
            CrashCause::OutOfMemory
        } else {
            CrashCause::Other
        };
        Self { pid, status, cause }
    }

    pub fn probable_out_of_memory(&self) -> bool {
        self.cause == CrashCause::OutOfMemory
    }

    /// Human-readable notice suitable for showing to the user.
    pub fn crash_notice(&self) -> String {
        let hint = match self.cause {
            CrashCause::OutOfMemory => {
                "There was probably not enough memory for the plugins. If reloading does not help, check the server logs."
            }
            CrashCause::ChannelFailure => {
                "The plugin host sent a corrupted message. If reloading does not help, check the server logs."
            }
            CrashCause::Other => "If reloading does not help, check the server logs.",
        };
        format!(
            "The plugin host crashed unexpectedly ({}) and plugins are no longer running. Reload to restart them. {hint}",
            self.status
        )
    }
}
