//! Worker side of the plugin host channel.
//!
//! The worker connects to the endpoint name it was given as its last
//! argument, then serves application messages until the supervisor asks it
//! to terminate or closes the channel.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::CborCodec;
use crate::bridge::endpoint::connect;
use crate::bridge::protocol::{HostMessage, Value};

/// Handle for posting messages back to the supervisor.
///
/// Messages are queued and written by a single task, so posts from
/// concurrent callers are never interleaved mid-frame.
#[derive(Clone)]
pub struct HostSender {
    tx: mpsc::UnboundedSender<HostMessage>,
}

impl HostSender {
    pub fn new(tx: mpsc::UnboundedSender<HostMessage>) -> Self {
        Self { tx }
    }

    pub fn post(&self, payload: Value) -> io::Result<()> {
        self.tx
            .send(HostMessage::Application(payload))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host channel closed"))
    }
}

/// Plugin runtime hosted by the worker process.
#[async_trait::async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    /// Handle one application message from the supervisor. Messages are
    /// delivered one at a time, in order.
    async fn on_message(&self, payload: Value, host: &HostSender);

    /// Release resources before exit. Cut short once `deadline` elapses.
    async fn shutdown(&self, deadline: Duration) {
        let _ = deadline;
    }
}

/// Connect to `endpoint` and serve until terminated.
pub async fn run_worker<H: WorkerHandler>(handler: Arc<H>, endpoint: &str) -> io::Result<()> {
    tracing::trace!(endpoint, "Connecting to supervisor");
    let stream = connect(endpoint).await?;
    tracing::info!("Connected to supervisor");
    serve(handler, stream).await
}

/// Serve the channel over an already connected stream.
pub async fn serve<H, S>(handler: Arc<H>, stream: S) -> io::Result<()>
where
    H: WorkerHandler,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, CborCodec::<HostMessage>::new());
    let mut writer = FramedWrite::new(write_half, CborCodec::<HostMessage>::new());

    let (tx, mut rx) = mpsc::unbounded_channel::<HostMessage>();
    let host = HostSender::new(tx.clone());

    let forwarder = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let last = msg == HostMessage::TerminatedEvent;
            if let Err(e) = writer.send(msg).await {
                tracing::warn!(error = %e, "Failed to write to supervisor");
                break;
            }
            if last {
                break;
            }
        }
    });

    let result = loop {
        match reader.next().await {
            Some(Ok(HostMessage::Application(payload))) => {
                handler.on_message(payload, &host).await;
            }
            Some(Ok(HostMessage::TerminateRequest { timeout_ms })) => {
                let deadline = Duration::from_millis(timeout_ms);
                tracing::info!(timeout_ms, "Termination requested");
                if tokio::time::timeout(deadline, handler.shutdown(deadline))
                    .await
                    .is_err()
                {
                    tracing::warn!(timeout_ms, "Shutdown did not finish before deadline");
                }
                let _ = tx.send(HostMessage::TerminatedEvent);
                break Ok(());
            }
            Some(Ok(HostMessage::TerminatedEvent)) => {
                tracing::warn!("Ignoring TerminatedEvent sent by supervisor");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Host channel error");
                break Err(e);
            }
            None => {
                tracing::info!("Host channel closed, exiting");
                break Ok(());
            }
        }
    };

    drop(host);
    drop(tx);
    let _ = forwarder.await;
    result
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::UnixStream;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Value>>,
        shutdown_deadline: Mutex<Option<Duration>>,
    }

    #[async_trait::async_trait]
    impl WorkerHandler for Recorder {
        async fn on_message(&self, payload: Value, host: &HostSender) {
            self.seen.lock().unwrap().push(payload.clone());
            host.post(payload).unwrap();
        }

        async fn shutdown(&self, deadline: Duration) {
            *self.shutdown_deadline.lock().unwrap() = Some(deadline);
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl WorkerHandler for Stuck {
        async fn on_message(&self, _payload: Value, _host: &HostSender) {}

        async fn shutdown(&self, _deadline: Duration) {
            std::future::pending::<()>().await
        }
    }

    fn host_side(
        stream: UnixStream,
    ) -> (
        FramedRead<tokio::io::ReadHalf<UnixStream>, CborCodec<HostMessage>>,
        FramedWrite<tokio::io::WriteHalf<UnixStream>, CborCodec<HostMessage>>,
    ) {
        let (r, w) = tokio::io::split(stream);
        (
            FramedRead::new(r, CborCodec::new()),
            FramedWrite::new(w, CborCodec::new()),
        )
    }

    #[tokio::test]
    async fn echoes_in_order_then_acknowledges_termination() {
        let (host, worker) = UnixStream::pair().unwrap();
        let handler = Arc::new(Recorder::default());
        let task = tokio::spawn(serve(Arc::clone(&handler), worker));
        let (mut reader, mut writer) = host_side(host);

        for i in 0..3 {
            writer
                .send(HostMessage::Application(Value::Integer(i.into())))
                .await
                .unwrap();
        }
        writer
            .send(HostMessage::TerminateRequest { timeout_ms: 250 })
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(msg) = reader.next().await {
            received.push(msg.unwrap());
        }

        assert_eq!(
            received,
            vec![
                HostMessage::Application(Value::Integer(0.into())),
                HostMessage::Application(Value::Integer(1.into())),
                HostMessage::Application(Value::Integer(2.into())),
                HostMessage::TerminatedEvent,
            ]
        );
        task.await.unwrap().unwrap();
        assert_eq!(
            *handler.shutdown_deadline.lock().unwrap(),
            Some(Duration::from_millis(250))
        );
    }

    #[tokio::test]
    async fn slow_shutdown_is_cut_at_deadline() {
        let (host, worker) = UnixStream::pair().unwrap();
        let task = tokio::spawn(serve(Arc::new(Stuck), worker));
        let (mut reader, mut writer) = host_side(host);

        writer
            .send(HostMessage::TerminateRequest { timeout_ms: 50 })
            .await
            .unwrap();

        let ack = tokio::time::timeout(Duration::from_secs(2), reader.next())
            .await
            .unwrap();
        assert_eq!(ack.unwrap().unwrap(), HostMessage::TerminatedEvent);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exits_when_supervisor_hangs_up() {
        let (host, worker) = UnixStream::pair().unwrap();
        let task = tokio::spawn(serve(Arc::new(Recorder::default()), worker));
        drop(host);
        task.await.unwrap().unwrap();
    }
}
