//! Passive-mode data connections

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

/// How long a client has to open the data connection.
const DATA_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A listener opened by `PASV`/`EPSV`, consumed by the next transfer.
#[derive(Debug)]
pub struct PassiveListener {
    listener: TcpListener,
}

impl PassiveListener {
    pub async fn bind(ip: IpAddr) -> io::Result<Self> {
        let listener = TcpListener::bind((ip, 0)).await?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept the client's data connection, wrapping it in TLS when
    /// `tls` is set.
    pub async fn accept(self, tls: Option<&TlsAcceptor>) -> io::Result<DataStream> {
        let (stream, _) = tokio::time::timeout(DATA_CONNECT_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no data connection"))??;
        match tls {
            Some(acceptor) => Ok(DataStream::Tls(Box::new(acceptor.accept(stream).await?))),
            None => Ok(DataStream::Plain(stream)),
        }
    }
}

/// `PASV` reply text for an IPv4 address, or `None` for IPv6.
#[must_use]
pub fn pasv_address(ip: IpAddr, port: u16) -> Option<String> {
    let IpAddr::V4(v4) = ip else {
        return None;
    };
    let [a, b, c, d] = v4.octets();
    Some(format!(
        "Entering Passive Mode ({a},{b},{c},{d},{},{})",
        port >> 8,
        port & 0xff
    ))
}

/// Copy an upload into `sink` until the client closes the connection.
///
/// Many clients drop a TLS data connection without sending `close_notify`;
/// that unexpected EOF still ends the upload.
pub async fn receive<R, W>(data: &mut R, sink: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match data.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        sink.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    Ok(total)
}

/// A data connection, in plain text or under `PROT P`.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
