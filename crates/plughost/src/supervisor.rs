//! Plugin host supervisor - manages the worker subprocess lifecycle.
//!
//! Flow:
//! 1. Terminate any previous worker (lifecycles never overlap)
//! 2. Build the environment, reserve an IPC endpoint, spawn the worker with
//!    the endpoint name as its positional argument
//! 3. Wait for the worker to connect back, wrap the socket in the framed codec
//! 4. Pump inbound messages to the client sink; drain outbound sends through a
//!    single writer task
//! 5. On stop: graceful handshake, escalating to a process tree kill
//! 6. On unexpected exit: report to the exit listener, skip the handshake

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadHalf, WriteHalf};
use tokio::process::Child;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::CborCodec;
use crate::bridge::endpoint::{IpcEndpoint, PeerStream};
use crate::bridge::protocol::{HostMessage, Value};
use crate::config::{SpawnError, SupervisorConfig, WorkerLaunch};
use crate::env::{EnvironmentBuilder, inspect_args};
use crate::exit::{ExitEvent, ExitStatusInfo};
use crate::process_tree::kill_process_tree;
use crate::termination::{TerminationState, WorkerHandles, terminate_worker};

type ChannelReader = FramedRead<ReadHalf<PeerStream>, CborCodec<HostMessage>>;
type ChannelWriter = FramedWrite<WriteHalf<PeerStream>, CborCodec<HostMessage>>;

/// Receives every application message relayed from the worker.
pub trait ClientSink: Send + Sync {
    fn post_message(&self, source_id: &str, payload: Value);
}

impl<F> ClientSink for F
where
    F: Fn(&str, Value) + Send + Sync,
{
    fn post_message(&self, source_id: &str, payload: Value) {
        self(source_id, payload)
    }
}

pub type ExitListener = Arc<dyn Fn(ExitEvent) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn plugin host: {0}")]
    SpawnFailed(#[source] SpawnError),
    #[error("plugin host channel unavailable")]
    ChannelUnavailable,
    #[error("IPC endpoint error: {0}")]
    Endpoint(#[source] std::io::Error),
    #[error("plugin host did not connect within {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("plugin host exited before connecting ({0})")]
    WorkerExited(ExitStatusInfo),
    #[error("plugin host was stopped before it connected")]
    StoppedDuringStart,
}

/// Poisoning only means another thread panicked mid-update; the guarded
/// values here stay consistent, so recover the guard.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One launched worker: its process, channel and lifecycle state.
struct Session {
    pid: u32,
    endpoint: String,
    state: watch::Sender<TerminationState>,
    exit: watch::Sender<Option<ExitStatusInfo>>,
    outbound: StdMutex<Option<mpsc::UnboundedSender<HostMessage>>>,
    acknowledged: Notify,
    channel_failed: AtomicBool,
}

impl Session {
    fn new(pid: u32, endpoint: String) -> Self {
        Self {
            pid,
            endpoint,
            state: watch::channel(TerminationState::Running).0,
            exit: watch::channel(None).0,
            outbound: StdMutex::new(None),
            acknowledged: Notify::new(),
            channel_failed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> TerminationState {
        *self.state.borrow()
    }

    /// Atomically move `from` -> `to`; false if the state was something else.
    fn transition(&self, from: TerminationState, to: TerminationState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Drop the writer side of the channel. The writer task drains what is
    /// already queued, then exits.
    fn release_channel(&self) {
        lock(&self.outbound).take();
    }
}

struct Shared {
    config: SupervisorConfig,
    environment: EnvironmentBuilder,
    current: StdMutex<Option<Arc<Session>>>,
    client: StdMutex<Option<Arc<dyn ClientSink>>>,
    exit_listener: StdMutex<Option<ExitListener>>,
}

impl Shared {
    fn current(&self) -> Option<Arc<Session>> {
        lock(&self.current).clone()
    }

    /// Forget `session` if it is still the current one.
    fn clear(&self, session: &Arc<Session>) {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *current = None;
        }
    }

    fn deliver(&self, payload: Value) {
        let client = lock(&self.client).clone();
        match client {
            Some(client) => client.post_message(&self.config.source_id, payload),
            None => tracing::debug!("No client registered, dropping plugin host message"),
        }
    }

    fn notify_exit(&self, event: ExitEvent) {
        let listener = lock(&self.exit_listener).clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }
}

/// Supervises a single out-of-process plugin host.
pub struct PluginHostSupervisor {
    shared: Arc<Shared>,
    launch: tokio::sync::Mutex<()>,
}

impl PluginHostSupervisor {
    pub fn new(config: SupervisorConfig, environment: EnvironmentBuilder) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                environment,
                current: StdMutex::new(None),
                client: StdMutex::new(None),
                exit_listener: StdMutex::new(None),
            }),
            launch: tokio::sync::Mutex::new(()),
        }
    }

    /// Register the sink receiving inbound messages. Replaces any previous one.
    /// Never launches the worker; only [`start`](Self::start) does.
    pub fn set_client(&self, client: impl ClientSink + 'static) {
        *lock(&self.shared.client) = Some(Arc::new(client));
    }

    /// Register the listener for unexpected worker exits.
    pub fn on_exit(&self, listener: impl Fn(ExitEvent) + Send + Sync + 'static) {
        *lock(&self.shared.exit_listener) = Some(Arc::new(listener));
    }

    pub fn state(&self) -> TerminationState {
        self.shared
            .current()
            .map(|s| s.state())
            .unwrap_or(TerminationState::Terminated)
    }

    pub fn is_running(&self) -> bool {
        self.state() == TerminationState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.current().map(|s| s.pid)
    }

    pub fn endpoint_name(&self) -> Option<String> {
        self.shared.current().map(|s| s.endpoint.clone())
    }

    /// Launch the worker and wait until it has connected back.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _launch = self.launch.lock().await;

        if self.shared.current().is_some() {
            tracing::info!("Plugin host already running, terminating before restart");
            self.stop().await;
        }

        let config = &self.shared.config;
        let endpoint = IpcEndpoint::create().map_err(SupervisorError::Endpoint)?;

        let mut args = config.exec_args.clone();
        args.extend(inspect_args(&config.server_name, &config.supervisor_args));
        args.push(endpoint.name().to_string());
        let launch = WorkerLaunch {
            program: config.program.clone(),
            args,
            env: self.shared.environment.build_os(std::env::vars_os()),
        };

        tracing::info!(program = %launch.program.display(), endpoint = %endpoint.name(), "Spawning plugin host");
        let mut child = config.spawner.spawn(&launch).map_err(|e| {
            tracing::error!(error = %e, "Failed to spawn plugin host");
            SupervisorError::SpawnFailed(e)
        })?;
        let pid = child.id().ok_or_else(|| {
            SupervisorError::SpawnFailed(SpawnError::Other("process exited during spawn".to_string()))
        })?;
        tracing::debug!(pid, "[{}: {}] IPC started", config.server_name, pid);

        forward_output(&mut child, &config.server_name, pid);

        let session = Arc::new(Session::new(pid, endpoint.name().to_string()));
        *lock(&self.shared.current) = Some(Arc::clone(&session));
        tokio::spawn(watch_exit(
            child,
            Arc::clone(&self.shared),
            Arc::clone(&session),
        ));

        let mut exit_rx = session.exit.subscribe();
        let connected = tokio::select! {
            peer = endpoint.wait_for_peer() => peer.map_err(SupervisorError::Endpoint),
            status = exit_rx.wait_for(Option::is_some) => {
                let status = status.ok().and_then(|s| (*s).clone()).unwrap_or_default();
                Err(SupervisorError::WorkerExited(status))
            }
            _ = tokio::time::sleep(config.connect_timeout) => {
                Err(SupervisorError::ConnectTimeout(config.connect_timeout))
            }
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(pid, error = %e, "Plugin host failed to connect");
                if !matches!(e, SupervisorError::WorkerExited(_)) {
                    self.stop().await;
                }
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, CborCodec::<HostMessage>::new());
        let writer = FramedWrite::new(write_half, CborCodec::<HostMessage>::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *lock(&session.outbound) = Some(outbound_tx);

        // A concurrent stop() may have claimed the session while we waited.
        if session.state() != TerminationState::Running {
            session.release_channel();
            tracing::warn!(pid, "Plugin host stopped while connecting");
            return Err(SupervisorError::StoppedDuringStart);
        }

        tokio::spawn(run_writer(writer, outbound_rx, pid));
        tokio::spawn(run_reader(
            reader,
            Arc::clone(&self.shared),
            Arc::clone(&session),
        ));

        tracing::info!(pid, "Plugin host connected");
        Ok(())
    }

    /// Terminate the worker. Concurrent callers share one termination; with no
    /// worker this is a no-op.
    pub async fn stop(&self) {
        let Some(session) = self.shared.current() else {
            return;
        };

        let mut done = session.state.subscribe();
        if session.transition(TerminationState::Running, TerminationState::Terminating) {
            tokio::spawn(run_termination(
                Arc::clone(&self.shared),
                Arc::clone(&session),
            ));
        } else {
            tracing::debug!(pid = session.pid, "Termination already in progress");
        }

        let _ = done
            .wait_for(|state| *state == TerminationState::Terminated)
            .await;
    }

    /// Queue `payload` for the worker. Never waits; write errors surface
    /// through the exit path.
    pub fn send(&self, payload: Value) -> Result<(), SupervisorError> {
        let session = self
            .shared
            .current()
            .ok_or(SupervisorError::ChannelUnavailable)?;
        if session.state() != TerminationState::Running {
            return Err(SupervisorError::ChannelUnavailable);
        }
        let outbound = lock(&session.outbound);
        let tx = outbound.as_ref().ok_or(SupervisorError::ChannelUnavailable)?;
        tx.send(HostMessage::Application(payload))
            .map_err(|_| SupervisorError::ChannelUnavailable)
    }

    /// Whether messages addressed to `host_id` belong to this supervisor.
    pub fn accepts_message(&self, host_id: &str) -> bool {
        host_id == self.shared.config.source_id
    }

    /// Route a message addressed to `host_id`. Returns false if it is not ours.
    pub fn handle_message(&self, host_id: &str, payload: Value) -> Result<bool, SupervisorError> {
        if !self.accepts_message(host_id) {
            return Ok(false);
        }
        self.send(payload)?;
        Ok(true)
    }
}

fn forward_output(child: &mut Child, server_name: &str, pid: u32) {
    if let Some(stdout) = child.stdout.take() {
        let prefix = format!("[{server_name}: {pid}]");
        tokio::spawn(forward_lines(stdout, move |line| {
            tracing::info!(target: "plughost::worker", "{} {}", prefix, line);
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let prefix = format!("[{server_name}: {pid}]");
        tokio::spawn(forward_lines(stderr, move |line| {
            tracing::error!(target: "plughost::worker", "{} {}", prefix, line);
        }));
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(output: R, emit: impl Fn(&str)) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => emit(&line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Plugin host output stream error");
                break;
            }
        }
    }
}

/// Owns the child handle; reaps it and reports exits that nobody asked for.
async fn watch_exit(mut child: Child, shared: Arc<Shared>, session: Arc<Session>) {
    let pid = session.pid;
    let status = match child.wait().await {
        Ok(status) => ExitStatusInfo::from(status),
        Err(e) => {
            tracing::error!(pid, error = %e, "Failed to wait for plugin host");
            ExitStatusInfo::default()
        }
    };
    session.exit.send_replace(Some(status.clone()));

    if !session.transition(TerminationState::Running, TerminationState::Terminated) {
        tracing::debug!(pid, %status, "Plugin host exited");
        return;
    }

    session.release_channel();
    shared.clear(&session);

    let event = ExitEvent::new(
        pid,
        status,
        session.channel_failed.load(Ordering::Acquire),
    );
    tracing::error!(
        pid,
        code = ?event.status.code,
        signal = ?event.status.signal,
        cause = ?event.cause,
        "[{}: {}] IPC exited unexpectedly",
        shared.config.server_name,
        pid
    );
    tracing::warn!("{}", event.crash_notice());
    shared.notify_exit(event);
}

async fn run_termination(shared: Arc<Shared>, session: Arc<Session>) {
    let pid = session.pid;
    tracing::info!(pid, "Terminating plugin host");

    let outbound = lock(&session.outbound).clone();
    let report = terminate_worker(
        WorkerHandles {
            pid,
            outbound,
            acknowledged: &session.acknowledged,
            exit: session.exit.subscribe(),
        },
        shared.config.timeouts(),
        Arc::clone(&shared.config.process_tree),
        Arc::clone(&shared.config.killer),
    )
    .await;

    session.release_channel();
    shared.clear(&session);
    session.state.send_replace(TerminationState::Terminated);

    tracing::info!(
        pid,
        outcome = ?report.outcome,
        killed = report.kill.as_ref().map(|k| k.attempted()).unwrap_or(0),
        "Plugin host terminated"
    );
}

async fn run_writer(
    mut writer: ChannelWriter,
    mut outbound_rx: mpsc::UnboundedReceiver<HostMessage>,
    pid: u32,
) {
    while let Some(message) = outbound_rx.recv().await {
        if let Err(e) = writer.send(message).await {
            tracing::warn!(pid, error = %e, "Failed to write to plugin host");
            break;
        }
    }
    tracing::trace!(pid, "Plugin host writer exiting");
}

async fn run_reader(mut reader: ChannelReader, shared: Arc<Shared>, session: Arc<Session>) {
    let pid = session.pid;
    loop {
        match reader.next().await {
            Some(Ok(HostMessage::Application(payload))) => shared.deliver(payload),
            Some(Ok(HostMessage::TerminatedEvent)) => {
                if session.state() == TerminationState::Terminating {
                    tracing::debug!(pid, "Plugin host acknowledged termination");
                    session.acknowledged.notify_one();
                } else {
                    tracing::warn!(pid, "Ignoring unsolicited TerminatedEvent");
                }
            }
            Some(Ok(HostMessage::TerminateRequest { .. })) => {
                tracing::warn!(pid, "Ignoring TerminateRequest sent by plugin host");
            }
            Some(Err(e)) => {
                tracing::error!(pid, error = %e, "Malformed frame from plugin host, closing channel");
                fail_channel(&shared, &session).await;
                break;
            }
            None => {
                tracing::debug!(pid, "Plugin host channel closed");
                session.release_channel();
                break;
            }
        }
    }
}

/// A corrupt channel is treated like a crash: kill the worker and let the exit
/// watcher report it.
async fn fail_channel(shared: &Arc<Shared>, session: &Arc<Session>) {
    session.channel_failed.store(true, Ordering::Release);
    session.release_channel();
    if session.state() != TerminationState::Running {
        return;
    }

    let pid = session.pid;
    let tree = Arc::clone(&shared.config.process_tree);
    let killer = Arc::clone(&shared.config.killer);
    if let Err(e) = tokio::task::spawn_blocking(move || {
        kill_process_tree(pid, tree.as_ref(), killer.as_ref())
    })
    .await
    {
        tracing::error!(pid, error = %e, "Process tree kill task failed");
    }
}
