//! SSH connection handling
//!
//! Each accepted TCP connection runs one russh server session. Session
//! channels may request the `sftp` subsystem or an `scp` exec command;
//! anything else is refused.

use super::filesystem::SftpHandler;
use super::scp::ScpCommand;
use crate::auth::{Authenticator, Proof};
use crate::error::Error;
use crate::listener::Service;
use crate::vfs::VirtualRoot;
use russh::keys::PublicKey;
use russh::server::{Auth, Config, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const PROTOCOL: &str = "SFTP";

/// Shared state for every connection to one SFTP fixture.
pub struct SshService {
    config: Arc<Config>,
    authenticator: Arc<dyn Authenticator>,
    root: VirtualRoot,
}

impl SshService {
    #[must_use]
    pub fn new(config: Config, authenticator: Arc<dyn Authenticator>, root: VirtualRoot) -> Self {
        Self {
            config: Arc::new(config),
            authenticator,
            root,
        }
    }
}

impl Service for SshService {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let handler = SshSession::new(Arc::clone(&self.authenticator), self.root.clone(), peer);
        match russh::server::run_stream(Arc::clone(&self.config), stream, handler).await {
            Ok(session) => {
                if let Err(e) = session.await {
                    debug!("SSH session from {} ended: {}", peer, e);
                }
            }
            Err(e) => debug!("SSH handshake with {} failed: {}", peer, e),
        }
    }
}

/// Per-connection SSH handler.
pub struct SshSession {
    authenticator: Arc<dyn Authenticator>,
    root: VirtualRoot,
    peer: SocketAddr,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SshSession {
    #[must_use]
    pub fn new(authenticator: Arc<dyn Authenticator>, root: VirtualRoot, peer: SocketAddr) -> Self {
        Self {
            authenticator,
            root,
            peer,
            channels: HashMap::new(),
        }
    }

    fn decide(&self, user: &str, proof: Proof<'_>) -> Auth {
        if self.authenticator.authenticate(user, proof) {
            info!("SSH user {} authenticated from {}", user, self.peer);
            Auth::Accept
        } else {
            warn!("SSH login refused for user {} from {}", user, self.peer);
            Auth::reject()
        }
    }

    fn key_proof_bytes(public_key: &PublicKey) -> Vec<u8> {
        public_key.to_bytes().unwrap_or_default()
    }
}

impl Handler for SshSession {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.decide(user, Proof::Password(password)))
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let blob = Self::key_proof_bytes(public_key);
        Ok(self.decide(user, Proof::PublicKey(&blob)))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let blob = Self::key_proof_bytes(public_key);
        Ok(self.decide(user, Proof::PublicKey(&blob)))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let channel = (name == "sftp")
            .then(|| self.channels.remove(&channel_id))
            .flatten();
        let Some(channel) = channel else {
            warn!("Refusing SSH subsystem {}", name);
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        debug!("Starting SFTP subsystem for {}", self.peer);
        session.channel_success(channel_id)?;
        russh_sftp::server::run(channel.into_stream(), SftpHandler::new(self.root.clone())).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        let scp = match ScpCommand::parse(&command) {
            Ok(scp) => scp,
            Err(e) => {
                warn!("Refusing SSH exec {:?}: {}", command, e);
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        info!("Running {:?} for {}", command, self.peer);
        session.channel_success(channel_id)?;

        let handle = session.handle();
        let root = self.root.clone();
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let status = scp.serve(&root, &mut stream).await;
            let _ = stream.flush().await;
            let _ = handle.exit_status_request(channel_id, status).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
        Ok(())
    }
}
