//! Shared helpers for the fixture integration tests
//!
//! - [`write_keystore`] generates a self-signed PEM keystore with `rcgen`.
//! - [`ftp_connect`] and [`ftp_login`] open `suppaftp` sessions (explicit
//!   TLS, passive mode). The client is blocking: call it inside
//!   [`blocking`] from a multi-thread runtime.
//! - [`FtpsClient`] is a raw control-channel client for checking reply
//!   codes and `PROT C` transfers over `EPSV`.
//! - [`ssh_connect`], [`ssh_connect_with_key`] and [`sftp_session`] open
//!   russh client sessions.

#![allow(dead_code)]

use russh::client;
use russh_sftp::client::SftpSession;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use suppaftp::native_tls;
use suppaftp::{FtpError, NativeTlsConnector, NativeTlsFtpStream};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// Write `server.pem` (certificate chain + private key) into `dir`.
pub fn write_keystore(dir: &Path) -> PathBuf {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("generate self-signed cert");
    let mut pem = cert.cert.pem();
    pem.push_str(&cert.key_pair.serialize_pem());

    let path = dir.join("server.pem");
    std::fs::write(&path, pem).expect("write keystore");
    path
}

// ── suppaftp ──────────────────────────────────────────────────────

/// Run blocking client calls without stalling the fixture's runtime.
///
/// Needs `#[tokio::test(flavor = "multi_thread")]`.
pub fn blocking<T>(f: impl FnOnce() -> T) -> T {
    tokio::task::block_in_place(f)
}

/// Connect and upgrade with `AUTH TLS`, `PBSZ 0`, `PROT P`.
pub fn ftp_connect(addr: SocketAddr) -> NativeTlsFtpStream {
    let stream = NativeTlsFtpStream::connect(addr).expect("FTP connect");
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .expect("TLS connector");
    stream
        .into_secure(NativeTlsConnector::from(connector), "localhost")
        .expect("AUTH TLS")
}

/// [`ftp_connect`] then log in.
pub fn ftp_login(addr: SocketAddr, user: &str, password: &str) -> NativeTlsFtpStream {
    let mut ftp = ftp_connect(addr);
    ftp.login(user, password).expect("FTP login");
    ftp
}

/// The reply code a command was refused with.
pub fn refusal_code(err: &FtpError) -> Option<u32> {
    match err {
        FtpError::UnexpectedResponse(response) => Some(response.status.code()),
        _ => None,
    }
}

// ── Raw FTPS client ───────────────────────────────────────────────

/// Build a TLS connector that accepts all certificates.
fn tls_connector() -> TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// A reply from the server: code and the text of its last line.
#[derive(Debug)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

/// Either side of a data connection.
pub trait DataIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DataIo for T {}

pub struct FtpsClient {
    control: BufReader<TlsStream<TcpStream>>,
    connector: TlsConnector,
    addr: SocketAddr,
    protected: bool,
}

impl FtpsClient {
    /// Connect, upgrade the control channel and protect the data channel.
    pub async fn connect(addr: SocketAddr) -> Self {
        let tcp = TcpStream::connect(addr).await.expect("connect");
        let mut plain = BufReader::new(tcp);
        assert_eq!(read_reply(&mut plain).await.code, 220);

        plain.get_mut().write_all(b"AUTH TLS\r\n").await.unwrap();
        assert_eq!(read_reply(&mut plain).await.code, 234);

        let connector = tls_connector();
        let tls = connector
            .connect(server_name(addr), plain.into_inner())
            .await
            .expect("TLS handshake");

        let mut client = Self {
            control: BufReader::new(tls),
            connector,
            addr,
            protected: true,
        };
        assert_eq!(client.command("PBSZ 0").await.code, 200);
        assert_eq!(client.command("PROT P").await.code, 200);
        client
    }

    /// Send one command and read its reply.
    pub async fn command(&mut self, line: &str) -> Reply {
        self.control
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.control.get_mut().flush().await.unwrap();
        read_reply(&mut self.control).await
    }

    /// `USER` then `PASS`; returns the `PASS` reply code.
    pub async fn login(&mut self, user: &str, password: &str) -> u16 {
        assert_eq!(self.command(&format!("USER {user}")).await.code, 331);
        self.command(&format!("PASS {password}")).await.code
    }

    /// Send `PROT <level>`; later transfers follow the accepted level.
    pub async fn protect(&mut self, level: &str) -> u16 {
        let code = self.command(&format!("PROT {level}")).await.code;
        if code == 200 {
            self.protected = level.eq_ignore_ascii_case("P");
        }
        code
    }

    /// Run a transfer command that downloads, returning the bytes.
    pub async fn download(&mut self, line: &str) -> Result<Vec<u8>, Reply> {
        let (mut data, first) = self.start_transfer(line).await?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await.unwrap();
        drop(data);
        let done = read_reply(&mut self.control).await;
        assert_eq!(done.code, 226, "after {}: {}", first.text, done.text);
        Ok(buf)
    }

    /// Run a transfer command that uploads `bytes`.
    pub async fn upload(&mut self, line: &str, bytes: &[u8]) -> Result<(), Reply> {
        let (mut data, _) = self.start_transfer(line).await?;
        data.write_all(bytes).await.unwrap();
        data.shutdown().await.unwrap();
        drop(data);
        let done = read_reply(&mut self.control).await;
        assert_eq!(done.code, 226, "upload failed: {}", done.text);
        Ok(())
    }

    async fn start_transfer(
        &mut self,
        line: &str,
    ) -> Result<(Box<dyn DataIo>, Reply), Reply> {
        let reply = self.command("EPSV").await;
        assert_eq!(reply.code, 229, "EPSV failed: {}", reply.text);
        let port: u16 = reply
            .text
            .split('|')
            .nth(3)
            .and_then(|p| p.parse().ok())
            .expect("EPSV port");
        let tcp = TcpStream::connect((self.addr.ip(), port))
            .await
            .expect("data connect");

        self.control
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.control.get_mut().flush().await.unwrap();

        // A refusal (550) arrives before the server accepts the data
        // connection.
        let first = read_reply(&mut self.control).await;
        if first.code != 150 {
            return Err(first);
        }
        if !self.protected {
            return Ok((Box::new(tcp), first));
        }
        let data = self
            .connector
            .connect(server_name(self.addr), tcp)
            .await
            .expect("data TLS handshake");
        Ok((Box::new(data), first))
    }

    pub async fn list(&mut self, path: Option<&str>) -> String {
        let line = path.map_or_else(|| "LIST".to_string(), |p| format!("LIST {p}"));
        let bytes = self.download(&line).await.expect("LIST refused");
        String::from_utf8(bytes).unwrap()
    }

    pub async fn quit(mut self) {
        assert_eq!(self.command("QUIT").await.code, 221);
    }
}

fn server_name(addr: SocketAddr) -> ServerName<'static> {
    ServerName::IpAddress(addr.ip().into())
}

async fn read_reply<S>(stream: &mut BufReader<S>) -> Reply
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    stream.read_line(&mut line).await.expect("read reply");
    let code: u16 = line
        .get(..3)
        .and_then(|c| c.parse().ok())
        .unwrap_or_else(|| panic!("malformed reply {line:?}"));

    // Multi-line replies end with "<code> text".
    if line.as_bytes().get(3) == Some(&b'-') {
        let end = format!("{code} ");
        loop {
            line.clear();
            stream.read_line(&mut line).await.expect("read reply");
            if line.starts_with(&end) || line.is_empty() {
                break;
            }
        }
    }

    Reply {
        code,
        text: line.get(4..).unwrap_or_default().trim_end().to_string(),
    }
}

/// Certificate verifier that accepts all certificates
/// (the fixtures use self-signed certs).
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ── SSH client ────────────────────────────────────────────────────

/// Client handler that trusts any host key.
pub struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connect and try password authentication. Returns the handle and
/// whether the server accepted the credentials.
pub async fn ssh_connect(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> (client::Handle<TrustingClient>, bool) {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, addr, TrustingClient)
        .await
        .expect("SSH connect");
    let accepted = handle
        .authenticate_password(user, password)
        .await
        .expect("SSH auth exchange")
        .success();
    (handle, accepted)
}

/// A fresh Ed25519 client key.
pub fn client_key() -> russh::keys::PrivateKey {
    let pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).expect("generate key");
    russh::keys::decode_secret_key(&pair.serialize_pem(), None).expect("decode key")
}

/// Connect and try public-key authentication with `key`.
pub async fn ssh_connect_with_key(
    addr: SocketAddr,
    user: &str,
    key: russh::keys::PrivateKey,
) -> (client::Handle<TrustingClient>, bool) {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, addr, TrustingClient)
        .await
        .expect("SSH connect");
    let key = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None);
    let accepted = handle
        .authenticate_publickey(user, key)
        .await
        .expect("SSH auth exchange")
        .success();
    (handle, accepted)
}

/// Open the `sftp` subsystem on an authenticated connection.
pub async fn sftp_session(handle: &client::Handle<TrustingClient>) -> SftpSession {
    let channel = handle.channel_open_session().await.expect("open channel");
    channel
        .request_subsystem(true, "sftp")
        .await
        .expect("request sftp subsystem");
    SftpSession::new(channel.into_stream())
        .await
        .expect("SFTP init")
}

/// Sorted names in an SFTP directory.
pub async fn sftp_names(sftp: &SftpSession, path: &str) -> Vec<String> {
    let mut names: Vec<String> = sftp
        .read_dir(path)
        .await
        .expect("read_dir")
        .map(|entry| entry.file_name())
        .collect();
    names.sort();
    names
}
