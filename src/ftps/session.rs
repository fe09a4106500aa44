//! One FTP control connection
//!
//! ```text
//!   Client connects via TCP
//!       |
//!   Server sends greeting: "220 ..."
//!       |
//!   AUTH TLS  -> "234", then TLS handshake on the same socket
//!       |
//!   PBSZ 0 / PROT P  (data connections are TLS too)
//!       |
//!   USER / PASS
//!       |
//!   PASV or EPSV, then LIST / RETR / STOR ...
//!       |
//!   QUIT
//! ```
//!
//! The command loop is generic over the stream so the same code runs
//! before and after the TLS upgrade.

use super::command::Command;
use super::data::{DataStream, PassiveListener, pasv_address, receive};
use super::io::{read_command, reply, write_line};
use super::listing::{Entry, list_line, mdtm, read_entries};
use super::policy::LoginGuard;
use super::server::FtpsService;
use super::user::User;
use crate::auth::{Authenticator, Proof};
use crate::vfs::VirtualRoot;
use chrono::Utc;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const FEATURES: &str = "211-Features:\r\n AUTH TLS\r\n PBSZ\r\n PROT\r\n EPSV\r\n PASV\r\n SIZE\r\n MDTM\r\n UTF8\r\n211 End\r\n";

/// What the command loop wants to happen next.
enum Flow {
    Continue,
    UpgradeTls,
    Quit,
}

struct Login {
    user: User,
    root: VirtualRoot,
    cwd: String,
    _slot: LoginGuard,
}

pub struct FtpSession {
    service: Arc<FtpsService>,
    local_ip: IpAddr,
    secure: bool,
    protect_data: bool,
    pending_user: Option<String>,
    login: Option<Login>,
    passive: Option<PassiveListener>,
    rename_from: Option<PathBuf>,
}

impl FtpSession {
    #[must_use]
    pub const fn new(service: Arc<FtpsService>, local_ip: IpAddr) -> Self {
        Self {
            service,
            local_ip,
            secure: false,
            protect_data: false,
            pending_user: None,
            login: None,
            passive: None,
            rename_from: None,
        }
    }

    /// Run the session to completion on an accepted connection.
    pub async fn run(mut self, stream: TcpStream) {
        let mut control = BufReader::new(stream);
        if reply(&mut control, 220, "ftp-test-fixtures FTPS server ready")
            .await
            .is_err()
        {
            return;
        }

        if !matches!(self.command_loop(&mut control).await, Flow::UpgradeTls) {
            return;
        }

        let tcp = control.into_inner();
        let tls = match self.service.acceptor().accept(tcp).await {
            Ok(tls) => tls,
            Err(e) => {
                debug!("TLS handshake failed: {}", e);
                return;
            }
        };
        self.secure = true;

        let mut control = BufReader::new(tls);
        self.command_loop(&mut control).await;
        let _ = control.get_mut().shutdown().await;
    }

    async fn command_loop<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        control: &mut BufReader<S>,
    ) -> Flow {
        loop {
            let mut line = String::new();
            match read_command(control, &mut line).await {
                Ok(0) => return Flow::Quit,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("Dropping FTP session: {}", e);
                    let _ = reply(control, 500, &e.to_string()).await;
                    return Flow::Quit;
                }
                Err(_) => return Flow::Quit,
            }
            if line.trim().is_empty() {
                continue;
            }

            let result = match Command::parse(&line) {
                Ok(command) => {
                    if matches!(command, Command::Pass(_)) {
                        debug!("<- PASS ****");
                    } else {
                        debug!("<- {}", line.trim_end());
                    }
                    self.dispatch(command, control).await
                }
                Err(e) => reply(control, 500, &e.to_string())
                    .await
                    .map(|()| Flow::Continue),
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(flow) => return flow,
                Err(e) => {
                    debug!("FTP control connection failed: {}", e);
                    return Flow::Quit;
                }
            }
        }
    }

    async fn dispatch<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        command: Command,
        control: &mut BufReader<S>,
    ) -> io::Result<Flow> {
        let rename_from = self.rename_from.take();

        if command.requires_login() && self.login.is_none() {
            reply(control, 530, "Please login with USER and PASS").await?;
            return Ok(Flow::Continue);
        }

        match command {
            Command::User(name) => {
                self.login = None;
                self.pending_user = Some(name);
                reply(control, 331, "User name okay, need password").await?;
            }
            Command::Pass(password) => return self.pass(&password, control).await,
            Command::Auth(mechanism) => return self.auth(&mechanism, control).await,
            Command::Pbsz(_) => {
                if self.secure {
                    reply(control, 200, "PBSZ=0").await?;
                } else {
                    reply(control, 503, "PBSZ requires AUTH").await?;
                }
            }
            Command::Prot(level) => self.prot(&level, control).await?,
            Command::Syst => reply(control, 215, "UNIX Type: L8").await?,
            Command::Feat => write_line(control, FEATURES).await?,
            Command::Opts(option) => {
                if option.eq_ignore_ascii_case("UTF8 ON") {
                    reply(control, 200, "Always in UTF8 mode").await?;
                } else {
                    reply(control, 501, "Option not understood").await?;
                }
            }
            Command::Noop => reply(control, 200, "Command okay").await?,
            Command::Quit => {
                // Free the login slot before the client sees the reply.
                self.login = None;
                reply(control, 221, "Goodbye").await?;
                return Ok(Flow::Quit);
            }
            Command::Unknown(verb) => {
                reply(control, 502, &format!("{verb} not implemented")).await?;
            }
            command => {
                let Some(mut login) = self.login.take() else {
                    return Ok(Flow::Continue);
                };
                let result = if command.requires_write() && !login.user.can_write() {
                    reply(control, 550, "Permission denied").await
                } else {
                    self.dispatch_logged_in(command, &mut login, rename_from, control)
                        .await
                };
                self.login = Some(login);
                result?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn pass<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        password: &str,
        control: &mut BufReader<S>,
    ) -> io::Result<Flow> {
        let Some(name) = self.pending_user.take() else {
            reply(control, 503, "Login with USER first").await?;
            return Ok(Flow::Continue);
        };

        let user = self
            .service
            .users()
            .authenticate(&name, Proof::Password(password))
            .then(|| self.service.users().get(&name))
            .flatten();
        let Some(user) = user else {
            warn!("FTP login failed for user {}", name);
            reply(control, 530, "Authentication failed").await?;
            return Ok(Flow::Continue);
        };

        let Some(slot) = self.service.policy().try_login() else {
            warn!(
                "Refusing login for {}: {} logins already active",
                name,
                self.service.policy().max_logins()
            );
            reply(control, 421, "Too many users logged in").await?;
            return Ok(Flow::Quit);
        };

        info!("FTP user {} logged in", name);
        self.login = Some(Login {
            root: VirtualRoot::new(&user.home_directory),
            user,
            cwd: "/".to_string(),
            _slot: slot,
        });
        reply(control, 230, "User logged in, proceed").await?;
        Ok(Flow::Continue)
    }

    async fn auth<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mechanism: &str,
        control: &mut BufReader<S>,
    ) -> io::Result<Flow> {
        if self.secure {
            reply(control, 503, "TLS already active").await?;
            return Ok(Flow::Continue);
        }
        match mechanism.to_ascii_uppercase().as_str() {
            "TLS" | "SSL" | "TLS-C" | "TLS-P" => {
                reply(control, 234, "AUTH command okay; starting TLS connection").await?;
                Ok(Flow::UpgradeTls)
            }
            _ => {
                reply(control, 504, "Unsupported AUTH mechanism").await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn prot<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        level: &str,
        control: &mut BufReader<S>,
    ) -> io::Result<()> {
        if !self.secure {
            return reply(control, 503, "PROT requires AUTH").await;
        }
        match level.to_ascii_uppercase().as_str() {
            "P" => {
                self.protect_data = true;
                reply(control, 200, "Command PROT okay").await
            }
            "C" => {
                self.protect_data = false;
                reply(control, 200, "Command PROT okay").await
            }
            "S" | "E" => reply(control, 536, "Protection level not supported").await,
            _ => reply(control, 504, "Unknown protection level").await,
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch_logged_in<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        command: Command,
        login: &mut Login,
        rename_from: Option<PathBuf>,
        control: &mut BufReader<S>,
    ) -> io::Result<()> {
        match command {
            Command::Type(kind) => match kind.chars().next().map(|c| c.to_ascii_uppercase()) {
                Some(c @ ('A' | 'I')) => reply(control, 200, &format!("Type set to {c}")).await,
                _ => reply(control, 504, "Type not supported").await,
            },
            Command::Mode(mode) if mode.eq_ignore_ascii_case("S") => {
                reply(control, 200, "Mode set to S").await
            }
            Command::Stru(stru) if stru.eq_ignore_ascii_case("F") => {
                reply(control, 200, "Structure set to F").await
            }
            Command::Mode(_) | Command::Stru(_) => {
                reply(control, 504, "Parameter not supported").await
            }
            Command::Pwd => {
                reply(control, 257, &format!("\"{}\" is current directory", login.cwd)).await
            }
            Command::Cwd(path) => {
                let (virt, real) = login.root.resolve(&login.cwd, &path);
                if tokio::fs::metadata(&real).await.is_ok_and(|m| m.is_dir()) {
                    reply(control, 250, &format!("Directory changed to {virt}")).await?;
                    login.cwd = virt;
                    Ok(())
                } else {
                    reply(control, 550, &format!("{path}: No such directory")).await
                }
            }
            Command::Cdup => {
                login.cwd = VirtualRoot::normalize(&login.cwd, "..");
                reply(control, 250, &format!("Directory changed to {}", login.cwd)).await
            }
            Command::Pasv => self.pasv(control).await,
            Command::Epsv => self.epsv(control).await,
            Command::List(path) => self.list(login, path.as_deref(), true, control).await,
            Command::Nlst(path) => self.list(login, path.as_deref(), false, control).await,
            Command::Retr(path) => self.retr(login, &path, control).await,
            Command::Stor(path) => self.store(login, &path, false, control).await,
            Command::Appe(path) => self.store(login, &path, true, control).await,
            Command::Dele(path) => {
                let (_, real) = login.root.resolve(&login.cwd, &path);
                match tokio::fs::remove_file(&real).await {
                    Ok(()) => reply(control, 250, "File deleted").await,
                    Err(e) => reply(control, 550, &format!("{path}: {e}")).await,
                }
            }
            Command::Mkd(path) => {
                let (virt, real) = login.root.resolve(&login.cwd, &path);
                match tokio::fs::create_dir(&real).await {
                    Ok(()) => reply(control, 257, &format!("\"{virt}\" created")).await,
                    Err(e) => reply(control, 550, &format!("{path}: {e}")).await,
                }
            }
            Command::Rmd(path) => {
                let (virt, real) = login.root.resolve(&login.cwd, &path);
                if virt == "/" {
                    return reply(control, 550, "Cannot remove the root directory").await;
                }
                match tokio::fs::remove_dir(&real).await {
                    Ok(()) => reply(control, 250, "Directory removed").await,
                    Err(e) => reply(control, 550, &format!("{path}: {e}")).await,
                }
            }
            Command::Rnfr(path) => {
                let (_, real) = login.root.resolve(&login.cwd, &path);
                if tokio::fs::try_exists(&real).await.unwrap_or(false) {
                    self.rename_from = Some(real);
                    reply(control, 350, "Ready for RNTO").await
                } else {
                    reply(control, 550, &format!("{path}: No such file or directory")).await
                }
            }
            Command::Rnto(path) => {
                let Some(from) = rename_from else {
                    return reply(control, 503, "Bad sequence of commands").await;
                };
                let (_, to) = login.root.resolve(&login.cwd, &path);
                match tokio::fs::rename(&from, &to).await {
                    Ok(()) => reply(control, 250, "Rename successful").await,
                    Err(e) => reply(control, 553, &format!("{path}: {e}")).await,
                }
            }
            Command::Size(path) => {
                let (_, real) = login.root.resolve(&login.cwd, &path);
                match tokio::fs::metadata(&real).await {
                    Ok(meta) if meta.is_file() => {
                        reply(control, 213, &meta.len().to_string()).await
                    }
                    _ => reply(control, 550, &format!("{path}: Not a plain file")).await,
                }
            }
            Command::Mdtm(path) => {
                let (_, real) = login.root.resolve(&login.cwd, &path);
                let stamp = tokio::fs::metadata(&real)
                    .await
                    .ok()
                    .filter(std::fs::Metadata::is_file)
                    .and_then(|meta| mdtm(&meta));
                match stamp {
                    Some(stamp) => reply(control, 213, &stamp).await,
                    None => reply(control, 550, &format!("{path}: Not a plain file")).await,
                }
            }
            other => {
                warn!("Unhandled FTP command {:?}", other);
                reply(control, 502, "Command not implemented").await
            }
        }
    }

    async fn pasv<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        control: &mut BufReader<S>,
    ) -> io::Result<()> {
        let passive = match PassiveListener::bind(self.local_ip).await {
            Ok(passive) => passive,
            Err(e) => return reply(control, 425, &format!("Can't open passive port: {e}")).await,
        };
        let Some(text) = pasv_address(self.local_ip, passive.port()?) else {
            return reply(control, 522, "PASV needs IPv4, use EPSV").await;
        };
        self.passive = Some(passive);
        reply(control, 227, &text).await
    }

    async fn epsv<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        control: &mut BufReader<S>,
    ) -> io::Result<()> {
        let passive = match PassiveListener::bind(self.local_ip).await {
            Ok(passive) => passive,
            Err(e) => return reply(control, 425, &format!("Can't open passive port: {e}")).await,
        };
        let port = passive.port()?;
        self.passive = Some(passive);
        reply(
            control,
            229,
            &format!("Entering Extended Passive Mode (|||{port}|)"),
        )
        .await
    }

    /// Send `150`, then accept the pending passive connection.
    async fn open_data<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        control: &mut BufReader<S>,
    ) -> io::Result<Option<DataStream>> {
        let Some(passive) = self.passive.take() else {
            reply(control, 425, "Use PASV or EPSV first").await?;
            return Ok(None);
        };
        reply(control, 150, "Opening data connection").await?;

        let tls = self.protect_data.then(|| self.service.acceptor().clone());
        match passive.accept(tls.as_ref()).await {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                reply(control, 425, &format!("Can't open data connection: {e}")).await?;
                Ok(None)
            }
        }
    }

    /// Reply `550` and close any pending passive listener, so a client
    /// already connecting to it gets a reset instead of waiting.
    async fn refuse_transfer<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        control: &mut BufReader<S>,
        text: &str,
    ) -> io::Result<()> {
        self.passive = None;
        reply(control, 550, text).await
    }

    async fn finish_transfer<S: AsyncRead + AsyncWrite + Unpin>(
        result: io::Result<()>,
        control: &mut BufReader<S>,
    ) -> io::Result<()> {
        match result {
            Ok(()) => reply(control, 226, "Transfer complete").await,
            Err(e) => {
                debug!("FTP data transfer failed: {}", e);
                reply(control, 426, &format!("Transfer aborted: {e}")).await
            }
        }
    }

    async fn list<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        login: &Login,
        path: Option<&str>,
        long: bool,
        control: &mut BufReader<S>,
    ) -> io::Result<()> {
        let (_, real) = login.root.resolve(&login.cwd, path.unwrap_or("."));
        let entries = match tokio::fs::metadata(&real).await {
            Ok(meta) if meta.is_dir() => read_entries(&real).await,
            Ok(meta) => Ok(vec![Entry {
                name: real
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                metadata: meta,
            }]),
            Err(e) => Err(e),
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                return self
                    .refuse_transfer(control, &format!("{}: {e}", path.unwrap_or(".")))
                    .await;
            }
        };

        let now = Utc::now();
        let text: String = entries
            .iter()
            .map(|entry| {
                if long {
                    list_line(entry, now)
                } else {
                    format!("{}\r\n", entry.name)
                }
            })
            .collect();

        let Some(mut data) = self.open_data(control).await? else {
            return Ok(());
        };
        let result = async {
            data.write_all(text.as_bytes()).await?;
            data.shutdown().await
        }
        .await;
        Self::finish_transfer(result, control).await
    }

    async fn retr<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        login: &Login,
        path: &str,
        control: &mut BufReader<S>,
    ) -> io::Result<()> {
        let (_, real) = login.root.resolve(&login.cwd, path);
        let file = match tokio::fs::metadata(&real).await {
            Ok(meta) if meta.is_file() => tokio::fs::File::open(&real).await,
            Ok(_) => {
                return self
                    .refuse_transfer(control, &format!("{path}: Not a plain file"))
                    .await;
            }
            Err(e) => Err(e),
        };
        let mut file = match file {
            Ok(file) => file,
            Err(e) => return self.refuse_transfer(control, &format!("{path}: {e}")).await,
        };

        let Some(mut data) = self.open_data(control).await? else {
            return Ok(());
        };
        let result = async {
            let sent = tokio::io::copy(&mut file, &mut data).await?;
            data.shutdown().await?;
            debug!("Sent {} bytes of {}", sent, real.display());
            Ok(())
        }
        .await;
        Self::finish_transfer(result, control).await
    }

    async fn store<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        login: &Login,
        path: &str,
        append: bool,
        control: &mut BufReader<S>,
    ) -> io::Result<()> {
        let (_, real) = login.root.resolve(&login.cwd, path);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&real)
            .await;
        let mut file = match file {
            Ok(file) => file,
            Err(e) => return self.refuse_transfer(control, &format!("{path}: {e}")).await,
        };

        let Some(mut data) = self.open_data(control).await? else {
            return Ok(());
        };
        let result = async {
            let received = receive(&mut data, &mut file).await?;
            file.flush().await?;
            debug!("Received {} bytes into {}", received, real.display());
            Ok(())
        }
        .await;
        Self::finish_transfer(result, control).await
    }
}
