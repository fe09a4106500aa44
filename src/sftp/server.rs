//! SFTP fixture lifecycle

use super::hostkey;
use super::session::{PROTOCOL, SshService};
use crate::auth::InsecureTestAuthenticator;
use crate::config::SftpConfig;
use crate::error::{Error, Result};
use crate::listener::ServerHandle;
use crate::vfs::VirtualRoot;
use russh::SshId;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Identification string sent to SSH clients.
pub const SERVER_ID: &str = concat!("SSH-2.0-FtpTestFixtures_", env!("CARGO_PKG_VERSION"));

/// Delay before answering a failed authentication attempt.
const AUTH_REJECTION_TIME: Duration = Duration::from_millis(100);

/// An embedded SSH server exposing SFTP and SCP over one directory.
///
/// Any password or public key is accepted for the configured username;
/// every other username is refused. Only use it in tests.
pub struct SftpTestServer {
    config: SftpConfig,
    service: Arc<SshService>,
    handle: ServerHandle,
}

/// What a running fixture looks like to a client.
#[derive(Debug, Clone, Serialize)]
pub struct FixtureInfo {
    pub protocol: &'static str,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub root_directory: PathBuf,
    pub version: &'static str,
}

impl SftpTestServer {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the host key cannot be loaded or the
    /// root directory cannot be created.
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Result<Self> {
        Self::from_config(SftpConfig::new(host, port, username))
    }

    /// Default host and port with a custom user.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_user(username: impl Into<String>) -> Result<Self> {
        Self::new(SftpConfig::DEFAULT_HOST, SftpConfig::DEFAULT_PORT, username)
    }

    /// Default host, port and user.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn new_default() -> Result<Self> {
        Self::from_config(SftpConfig::default())
    }

    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn from_config(config: SftpConfig) -> Result<Self> {
        let key = hostkey::load_or_generate(&config.host_key_path)?;

        std::fs::create_dir_all(&config.root_directory).map_err(|e| {
            error!(
                "Could not create SFTP root directory {}: {}",
                config.root_directory.display(),
                e
            );
            Error::config_with(
                format!(
                    "Could not create SFTP root directory {}",
                    config.root_directory.display()
                ),
                e,
            )
        })?;

        let ssh_config = russh::server::Config {
            server_id: SshId::Standard(SERVER_ID.to_string()),
            keys: vec![key],
            auth_rejection_time: AUTH_REJECTION_TIME,
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        };
        let service = SshService::new(
            ssh_config,
            Arc::new(InsecureTestAuthenticator::new(config.username.clone())),
            VirtualRoot::new(&config.root_directory),
        );
        let handle = ServerHandle::new(config.host.clone(), config.port);

        Ok(Self {
            config,
            service: Arc::new(service),
            handle,
        })
    }

    /// Bind the listener and start accepting SSH connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if started twice and
    /// [`Error::Start`] if the address cannot be bound.
    pub async fn start_server(&mut self) -> Result<()> {
        if !self.handle.is_stopped() {
            error!("SFTP server is already running");
            return Err(Error::AlreadyRunning(PROTOCOL));
        }

        match self.handle.start(Arc::clone(&self.service)).await {
            Ok(addr) => {
                info!(
                    "SFTP server listening on {} for user {} serving {}",
                    addr,
                    self.config.username,
                    self.config.root_directory.display()
                );
                Ok(())
            }
            Err(source) => {
                error!("Could not start SFTP server: {}", source);
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
            error!("Could not stop SFTP server: {}", source);
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

    /// The SSH identification string announced to clients.
    #[must_use]
    pub const fn version(&self) -> &'static str {
        SERVER_ID
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    #[must_use]
    pub const fn config(&self) -> &SftpConfig {
        &self.config
    }

    /// Connection details, with the bound port once running.
    #[must_use]
    pub fn info(&self) -> FixtureInfo {
        FixtureInfo {
            protocol: PROTOCOL,
            host: self.handle.host().to_string(),
            port: self
                .local_addr()
                .map_or_else(|| self.handle.port(), |addr| addr.port()),
            username: self.config.username.clone(),
            root_directory: self.config.root_directory.clone(),
            version: SERVER_ID,
        }
    }
}
