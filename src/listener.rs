//! Listener lifecycle shared by both fixtures
//!
//! A [`ServerHandle`] binds a TCP listener on `start` and runs an accept
//! loop on a tokio task. Each accepted connection is handed to a
//! [`Service`] on its own task. `stop` cancels the loop, aborts every live
//! session and releases the port before returning.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A protocol that serves one accepted connection at a time.
pub trait Service: Send + Sync + 'static {
    /// Short protocol name used in logs and errors, e.g. `"FTPS"`.
    fn protocol(&self) -> &'static str;

    /// Serve a single client connection until it ends.
    fn serve(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl Future<Output = ()> + Send;
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the bind address and, while running, the accept loop.
pub struct ServerHandle {
    host: String,
    port: u16,
    running: Option<Running>,
}

impl ServerHandle {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            running: None,
        }
    }

    /// The host the listener binds to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Change the bind host. Takes effect on the next start.
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// The configured port (`0` means OS-assigned).
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The bound address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.running.is_none()
    }

    /// Bind and spawn the accept loop.
    ///
    /// The caller must check [`is_stopped`](Self::is_stopped) first; a
    /// second listener is never spawned over a running one.
    pub(crate) async fn start<S: Service>(
        &mut self,
        service: Arc<S>,
    ) -> std::io::Result<SocketAddr> {
        debug_assert!(self.running.is_none());

        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(accept_loop(listener, service, shutdown.clone()));

        self.running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Cancel the accept loop and wait for it to release the port.
    ///
    /// Stopping an already stopped handle does nothing.
    pub(crate) async fn stop(&mut self) -> std::result::Result<(), JoinError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.shutdown.cancel();
        running.task.await
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
            running.task.abort();
        }
    }
}

/// Pause after a failed accept. Errors such as `EMFILE` persist until a
/// session closes a socket.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Wait [`ACCEPT_BACKOFF`]; `false` if shutdown came first.
async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

async fn accept_loop<S: Service>(
    listener: TcpListener,
    service: Arc<S>,
    shutdown: CancellationToken,
) {
    let protocol = service.protocol();
    info!("{} listener accepting connections", protocol);

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("{} connection from {}", protocol, peer);
                    sessions.spawn(Arc::clone(&service).serve(stream, peer));
                }
                Err(e) => {
                    warn!("{} accept failed: {}", protocol, e);
                    if !accept_backoff(&shutdown).await {
                        break;
                    }
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    drop(listener);
    sessions.shutdown().await;
    info!("{} listener stopped", protocol);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Writes a fixed banner and closes.
    struct Banner;

    impl Service for Banner {
        fn protocol(&self) -> &'static str {
            "BANNER"
        }

        async fn serve(self: Arc<Self>, mut stream: TcpStream, _peer: SocketAddr) {
            let _ = stream.write_all(b"hello\r\n").await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accept_error_backs_off() {
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(accept_backoff(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_ends_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let started = tokio::time::Instant::now();
        assert!(!accept_backoff(&shutdown).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn start_serves_connections() {
        let mut handle = ServerHandle::new("127.0.0.1", 0);
        assert!(handle.is_stopped());

        let addr = handle.start(Arc::new(Banner)).await.unwrap();
        assert!(!handle.is_stopped());
        assert_eq!(handle.local_addr(), Some(addr));
        assert_ne!(addr.port(), 0);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hello\r\n");

        handle.stop().await.unwrap();
        assert!(handle.is_stopped());
        assert!(handle.local_addr().is_none());
    }

    #[tokio::test]
    async fn stop_releases_the_port() {
        let mut handle = ServerHandle::new("127.0.0.1", 0);
        let addr = handle.start(Arc::new(Banner)).await.unwrap();
        handle.stop().await.unwrap();

        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn stop_when_stopped_is_noop() {
        let mut handle = ServerHandle::new("127.0.0.1", 0);
        handle.stop().await.unwrap();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn unbindable_host_fails() {
        // TEST-NET-1, never assigned to a local interface.
        let mut handle = ServerHandle::new("192.0.2.1", 0);
        assert!(handle.start(Arc::new(Banner)).await.is_err());
        assert!(handle.is_stopped());
    }
}
