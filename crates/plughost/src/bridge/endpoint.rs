//! One-shot IPC endpoint for the supervisor-worker channel.
//!
//! Platform-specific rendezvous:
//! - **Unix**: filesystem socket `{temp_dir}/plughost-{uuid}.sock`
//! - **Windows**: named pipe `\\.\pipe\plughost-{uuid}`
//!
//! The endpoint accepts exactly one peer. The listener is closed (and the socket
//! file unlinked) as soon as that peer connects. Waiting is unbounded; callers
//! apply their own timeout.

use std::io;

use uuid::Uuid;

pub use imp::{PeerStream, WorkerStream};

/// Ephemeral, uniquely named rendezvous point for a single worker launch.
pub struct IpcEndpoint {
    name: String,
    listener: imp::Listener,
}

impl IpcEndpoint {
    /// Bind a fresh endpoint with a random name.
    pub fn create() -> io::Result<Self> {
        let name = imp::fresh_name();
        let listener = imp::Listener::bind(&name)?;
        tracing::debug!(endpoint = %name, "Created IPC endpoint");
        Ok(Self { name, listener })
    }

    /// Bind a fresh endpoint inside `dir` instead of the system temp directory.
    #[cfg(unix)]
    pub fn create_in(dir: &std::path::Path) -> io::Result<Self> {
        let name = imp::name_in(dir);
        let listener = imp::Listener::bind(&name)?;
        tracing::debug!(endpoint = %name, "Created IPC endpoint");
        Ok(Self { name, listener })
    }

    /// Name the worker must connect to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the worker to connect. Consumes the endpoint: only one peer is
    /// ever accepted and the listener is gone once this resolves.
    pub async fn wait_for_peer(self) -> io::Result<PeerStream> {
        tracing::trace!(endpoint = %self.name, "Waiting for peer connection");
        let stream = self.listener.accept().await?;
        tracing::debug!(endpoint = %self.name, "Peer connected");
        Ok(stream)
    }
}

impl std::fmt::Debug for IpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcEndpoint").field("name", &self.name).finish()
    }
}

/// Connect from the worker side.
pub async fn connect(name: &str) -> io::Result<WorkerStream> {
    tracing::trace!(endpoint = %name, "Connecting to IPC endpoint");
    imp::connect(name).await
}

#[cfg(unix)]
mod imp {
    use std::io;
    use std::path::{Path, PathBuf};

    use tokio::net::{UnixListener, UnixStream};

    use super::Uuid;

    pub type PeerStream = UnixStream;
    pub type WorkerStream = UnixStream;

    pub fn fresh_name() -> String {
        name_in(&std::env::temp_dir())
    }

    pub fn name_in(dir: &Path) -> String {
        dir.join(format!("plughost-{}.sock", Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    pub struct Listener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl Listener {
        pub fn bind(name: &str) -> io::Result<Self> {
            let path = PathBuf::from(name);
            let listener = UnixListener::bind(&path)?;
            Ok(Self { listener, path })
        }

        pub async fn accept(self) -> io::Result<PeerStream> {
            let (stream, _) = self.listener.accept().await?;
            // Dropping self closes the listener and unlinks the socket file.
            Ok(stream)
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket file");
                }
            }
        }
    }

    pub async fn connect(name: &str) -> io::Result<WorkerStream> {
        UnixStream::connect(name).await
    }
}

#[cfg(windows)]
mod imp {
    use std::io;

    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    use super::Uuid;

    pub type PeerStream = NamedPipeServer;
    pub type WorkerStream = NamedPipeClient;

    pub fn fresh_name() -> String {
        format!(r"\\.\pipe\plughost-{}", Uuid::new_v4())
    }

    pub struct Listener {
        server: NamedPipeServer,
    }

    impl Listener {
        pub fn bind(name: &str) -> io::Result<Self> {
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .max_instances(1)
                .create(name)?;
            Ok(Self { server })
        }

        pub async fn accept(self) -> io::Result<PeerStream> {
            self.server.connect().await?;
            Ok(self.server)
        }
    }

    pub async fn connect(name: &str) -> io::Result<WorkerStream> {
        ClientOptions::new().open(name)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn endpoint_names_are_unique() {
        let a = IpcEndpoint::create().unwrap();
        let b = IpcEndpoint::create().unwrap();
        assert_ne!(a.name(), b.name());
        assert!(a.name().contains("plughost-"));
    }

    #[tokio::test]
    async fn accepts_exactly_one_peer() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = IpcEndpoint::create_in(dir.path()).unwrap();
        let name = endpoint.name().to_string();
        assert!(Path::new(&name).exists());

        let accept = tokio::spawn(endpoint.wait_for_peer());
        let _client = connect(&name).await.unwrap();
        let _peer = accept.await.unwrap().unwrap();

        // Listener closed and socket unlinked: nobody else can join.
        assert!(!Path::new(&name).exists());
        assert!(connect(&name).await.is_err());
    }

    #[tokio::test]
    async fn peer_and_worker_share_a_duplex_stream() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let endpoint = IpcEndpoint::create_in(dir.path()).unwrap();
        let name = endpoint.name().to_string();

        let accept = tokio::spawn(endpoint.wait_for_peer());
        let mut worker = connect(&name).await.unwrap();
        let mut peer = accept.await.unwrap().unwrap();

        worker.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn dropping_unused_endpoint_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = IpcEndpoint::create_in(dir.path()).unwrap();
        let name = endpoint.name().to_string();
        assert!(Path::new(&name).exists());

        drop(endpoint);
        assert!(!Path::new(&name).exists());
    }
}
