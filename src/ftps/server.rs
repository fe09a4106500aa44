//! FTPS fixture lifecycle

use super::policy::{ConnectionPolicy, MAX_LOGINS};
use super::session::FtpSession;
use super::user::{Authority, User, UserStore};
use crate::config::FtpsConfig;
use crate::error::{Error, Result};
use crate::listener::{ServerHandle, Service};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

const PROTOCOL: &str = "FTPS";

/// Shared state for every connection to one fixture.
pub struct FtpsService {
    acceptor: TlsAcceptor,
    users: UserStore,
    policy: ConnectionPolicy,
}

impl FtpsService {
    pub(crate) const fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    pub(crate) const fn users(&self) -> &UserStore {
        &self.users
    }

    pub(crate) const fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }
}

impl Service for FtpsService {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let local_ip = match stream.local_addr() {
            Ok(addr) => addr.ip(),
            Err(e) => {
                debug!("Dropping FTP connection from {}: {}", peer, e);
                return;
            }
        };
        FtpSession::new(self, local_ip).run(stream).await;
        debug!("FTP session from {} closed", peer);
    }
}

/// An embedded FTP-over-TLS server bound to one directory and one user.
///
/// Clients connect in plain text and upgrade with `AUTH TLS`; with
/// `PROT P` the passive data connections are encrypted too.
///
/// ```no_run
/// # async fn demo() -> ftp_test_fixtures::Result<()> {
/// let mut server = ftp_test_fixtures::create_test_ftps_server("ftpstest.properties")?;
/// server.start_server().await?;
/// // ... exercise the server with an FTPS client ...
/// server.stop_server().await?;
/// # Ok(())
/// # }
/// ```
pub struct FtpsTestServer {
    config: FtpsConfig,
    service: Arc<FtpsService>,
    handle: ServerHandle,
}

impl FtpsTestServer {
    /// Load the TLS material and register the configured user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the keystore cannot be loaded or the
    /// user cannot be saved.
    pub fn new(config: FtpsConfig) -> Result<Self> {
        let tls = config.tls.server_config().inspect_err(|e| {
            error!("Could not load FTPS keystore: {}", e.chain());
        })?;

        let users = UserStore::default();
        let user = User {
            name: config.account.username.clone(),
            password: config.account.secret.clone(),
            home_directory: config.root_directory.clone(),
            authorities: vec![Authority::Write],
        };
        if let Err(e) = users.save(user) {
            error!("Could not save FTP user: {}", e);
            return Err(Error::config_with("Could not save FTP user", e));
        }

        let service = FtpsService {
            acceptor: TlsAcceptor::from(tls),
            users,
            policy: ConnectionPolicy::new(MAX_LOGINS),
        };
        let handle = ServerHandle::new(config.host.clone(), config.port);

        Ok(Self {
            config,
            service: Arc::new(service),
            handle,
        })
    }

    /// Bind the listener and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if started twice and
    /// [`Error::Start`] if the root directory is missing or read-only, or
    /// the port cannot be bound.
    pub async fn start_server(&mut self) -> Result<()> {
        if !self.handle.is_stopped() {
            error!("FTPS server is already running");
            return Err(Error::AlreadyRunning(PROTOCOL));
        }

        let root = &self.config.root_directory;
        if let Err(source) = check_root(root).await {
            error!("Could not start FTPS server: {}", source);
            return Err(Error::Start {
                server: PROTOCOL,
                source,
            });
        }

        match self.handle.start(Arc::clone(&self.service)).await {
            Ok(addr) => {
                info!("FTPS server listening on {} serving {}", addr, root.display());
                Ok(())
            }
            Err(source) => {
                error!("Could not start FTPS server: {}", source);
                Err(Error::Start {
                    server: PROTOCOL,
                    source,
                })
            }
        }
    }

    /// Stop accepting connections and close live sessions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stop`] if the accept loop panicked.
    pub async fn stop_server(&mut self) -> Result<()> {
        self.handle.stop().await.map_err(|source| {
            error!("Could not stop FTPS server: {}", source);
            Error::Stop {
                server: PROTOCOL,
                source,
            }
        })
    }

    #[must_use]
    pub const fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    pub const fn handle_mut(&mut self) -> &mut ServerHandle {
        &mut self.handle
    }

    /// The bound address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    #[must_use]
    pub const fn config(&self) -> &FtpsConfig {
        &self.config
    }

    /// Number of sessions currently logged in.
    #[must_use]
    pub fn active_logins(&self) -> usize {
        self.service.policy.active_logins()
    }
}

/// The root must be an existing directory the user can write to.
async fn check_root(root: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::metadata(root).await.map_err(|e| {
        std::io::Error::new(
            e.kind(),
            format!("root directory {} does not exist", root.display()),
        )
    })?;
    if !meta.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            format!("root directory {} is not a directory", root.display()),
        ));
    }
    if meta.permissions().readonly() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("root directory {} is read-only", root.display()),
        ));
    }
    Ok(())
}
