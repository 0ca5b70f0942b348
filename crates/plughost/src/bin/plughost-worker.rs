//! Reference plugin host worker.
//!
//! Usage: `plughost-worker [--flags...] <endpoint>`
//!
//! Behaviour is selected with `PLUGHOST_WORKER_MODE`:
//! - `echo` (default): echoes every message; `"env:NAME"` replies with the
//!   value of `NAME` in the worker's environment
//! - `stubborn`: like echo, but never finishes shutting down
//! - `spawn-child`: spawns a sleeping child process, then acts stubborn;
//!   `"child-pid"` replies with the child's pid
//! - `late-connect`: like echo, but waits a second before connecting
//! - `malformed`: writes one undecodable frame and hangs
//! - `sleep`: ignores the endpoint and sleeps

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use plughost::bridge::endpoint::connect;
use plughost::bridge::protocol::Value;
use plughost::worker::{HostSender, WorkerHandler, run_worker};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const MODE_ENV: &str = "PLUGHOST_WORKER_MODE";

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PLUGHOST_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("plughost={level},plughost_worker={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// The endpoint is the last positional argument; inspector flags come first.
fn endpoint_arg(args: &[String]) -> Option<&str> {
    args.iter()
        .rev()
        .find(|arg| !arg.starts_with("--"))
        .map(String::as_str)
}

struct Echo {
    stubborn: bool,
    child_pid: Option<u32>,
}

#[async_trait::async_trait]
impl WorkerHandler for Echo {
    async fn on_message(&self, payload: Value, host: &HostSender) {
        let text = payload.as_text().map(str::to_owned);
        let reply = match text.as_deref() {
            Some("child-pid") => self
                .child_pid
                .map(|pid| Value::Integer(pid.into()))
                .unwrap_or(Value::Null),
            Some(text) if text.starts_with("env:") => {
                let name = &text["env:".len()..];
                std::env::var(name)
                    .map(Value::Text)
                    .unwrap_or(Value::Null)
            }
            _ => payload,
        };
        if let Err(e) = host.post(reply) {
            tracing::warn!(error = %e, "Failed to post reply");
        }
    }

    async fn shutdown(&self, deadline: Duration) {
        if self.stubborn {
            tracing::info!(?deadline, "Ignoring shutdown");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mode = std::env::var(MODE_ENV).unwrap_or_else(|_| "echo".to_string());
    let args: Vec<String> = std::env::args_os()
        .skip(1)
        .filter_map(|arg| arg.into_string().ok())
        .collect();
    println!("plughost-worker ready (mode: {mode}, pid: {})", std::process::id());

    if mode == "sleep" {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        return Ok(());
    }

    let endpoint = endpoint_arg(&args).context("missing endpoint argument")?;

    let handler = match mode.as_str() {
        "echo" => Echo {
            stubborn: false,
            child_pid: None,
        },
        "late-connect" => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Echo {
                stubborn: false,
                child_pid: None,
            }
        }
        "stubborn" => Echo {
            stubborn: true,
            child_pid: None,
        },
        "spawn-child" => {
            let exe = std::env::current_exe().context("failed to locate worker binary")?;
            let child = tokio::process::Command::new(exe)
                .env(MODE_ENV, "sleep")
                .spawn()
                .context("failed to spawn child process")?;
            tracing::info!(pid = ?child.id(), "Spawned child process");
            Echo {
                stubborn: true,
                child_pid: child.id(),
            }
        }
        "malformed" => {
            let mut stream = connect(endpoint).await?;
            // Length prefix of 3 followed by bytes that are not valid CBOR.
            stream.write_all(&[0, 0, 0, 3, 0xff, 0xff, 0xff]).await?;
            stream.flush().await?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Ok(());
        }
        other => anyhow::bail!("unknown worker mode: {other}"),
    };

    run_worker(Arc::new(handler), endpoint)
        .await
        .context("worker channel failed")?;
    tracing::info!("Worker exiting");
    Ok(())
}
