//! SCP over an SSH exec channel
//!
//! Supports the legacy rcp protocol for single files:
//!
//! ```text
//!   scp -t <target>   sink: client uploads
//!       server: \0
//!       client: [T<mtime> 0 <atime> 0\n]   server: \0
//!       client: C<mode> <size> <name>\n    server: \0
//!       client: <size bytes> \0            server: \0
//!       ... repeat, then EOF
//!
//!   scp -f <source>   source: client downloads
//!       client: \0
//!       server: [T...\n]                   client: \0
//!       server: C<mode> <size> <name>\n    client: \0
//!       server: <size bytes> \0            client: \0
//! ```
//!
//! Errors are sent to the client as `\x01<message>\n` and end the
//! transfer with exit status 1.

use crate::vfs::VirtualRoot;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScpMode {
    /// `-t`: the client sends files to us.
    Sink,
    /// `-f`: the client fetches a file from us.
    Source,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScpError {
    #[error("not an scp command")]
    NotScp,

    #[error("recursive copy is not supported")]
    Recursive,

    #[error("scp needs exactly one of -t or -f")]
    MissingMode,

    #[error("scp needs a target path")]
    MissingTarget,

    #[error("unknown scp option -{0}")]
    UnknownOption(char),
}

/// A parsed `scp` exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpCommand {
    pub mode: ScpMode,
    pub path: String,
    /// `-d`: the target must be a directory.
    pub target_is_dir: bool,
    /// `-p`: preserve modification times.
    pub preserve: bool,
    pub verbose: bool,
}

impl ScpCommand {
    /// Parse the command line of an exec request.
    ///
    /// # Errors
    ///
    /// Returns [`ScpError`] if the command is not `scp`, asks for
    /// recursion, or lacks a mode or path.
    pub fn parse(command: &str) -> Result<Self, ScpError> {
        let mut words = command.split_whitespace();
        if words.next() != Some("scp") {
            return Err(ScpError::NotScp);
        }

        let mut mode = None;
        let mut target_is_dir = false;
        let mut preserve = false;
        let mut verbose = false;
        let mut path = Vec::new();
        let mut options_done = false;

        for word in words {
            if options_done || !path.is_empty() || !word.starts_with('-') {
                path.push(word);
                continue;
            }
            if word == "--" {
                options_done = true;
                continue;
            }
            for flag in word.chars().skip(1) {
                match flag {
                    't' if mode.is_none() => mode = Some(ScpMode::Sink),
                    'f' if mode.is_none() => mode = Some(ScpMode::Source),
                    't' | 'f' => return Err(ScpError::MissingMode),
                    'd' => target_is_dir = true,
                    'p' => preserve = true,
                    'v' => verbose = true,
                    'r' => return Err(ScpError::Recursive),
                    other => return Err(ScpError::UnknownOption(other)),
                }
            }
        }

        let mode = mode.ok_or(ScpError::MissingMode)?;
        if path.is_empty() {
            return Err(ScpError::MissingTarget);
        }
        Ok(Self {
            mode,
            path: path.join(" "),
            target_is_dir,
            preserve,
            verbose,
        })
    }

    /// Run the transfer over `stream` and return the exit status.
    pub async fn serve<S>(&self, root: &VirtualRoot, stream: S) -> u32
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        let result = match self.mode {
            ScpMode::Sink => self.sink(root, &mut stream).await,
            ScpMode::Source => self.source(root, &mut stream).await,
        };
        match result {
            Ok(()) => {
                let _ = stream.get_mut().flush().await;
                0
            }
            Err(e) => {
                warn!("scp {} failed: {}", self.path, e);
                let message = format!("\x01scp: {}: {e}\n", self.path);
                let _ = stream.get_mut().write_all(message.as_bytes()).await;
                let _ = stream.get_mut().flush().await;
                1
            }
        }
    }

    async fn sink<S>(&self, root: &VirtualRoot, stream: &mut BufReader<S>) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (_, target) = root.resolve("/", &self.path);
        let into_dir = tokio::fs::metadata(&target)
            .await
            .is_ok_and(|m| m.is_dir());
        if self.target_is_dir && !into_dir {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a directory"));
        }

        ack(stream).await?;
        let mut times = None;
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end_matches('\n');

            match line.chars().next() {
                Some('T') => {
                    times = Some(parse_times(&line[1..])?);
                    ack(stream).await?;
                }
                Some('C') => {
                    let header = FileHeader::parse(&line[1..])?;
                    let path = if into_dir {
                        target.join(&header.name)
                    } else {
                        target.clone()
                    };
                    ack(stream).await?;
                    receive_file(stream, &path, header.size, times.take()).await?;
                    expect_ack(stream).await?;
                    ack(stream).await?;
                    info!("scp received {} ({} bytes)", path.display(), header.size);
                }
                Some('D' | 'E') => return Err(unsupported("directories are not supported")),
                _ => return Err(invalid(format!("unexpected scp message {line:?}"))),
            }
        }
    }

    async fn source<S>(&self, root: &VirtualRoot, stream: &mut BufReader<S>) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        expect_ack(stream).await?;

        let (_, path) = root.resolve("/", &self.path);
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(unsupported("not a regular file"));
        }

        if self.preserve {
            let seconds = |t: io::Result<SystemTime>| {
                t.ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs())
            };
            let line = format!(
                "T{} 0 {} 0\n",
                seconds(meta.modified()),
                seconds(meta.accessed())
            );
            send(stream, line.as_bytes()).await?;
            expect_ack(stream).await?;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = format!("C{:04o} {} {}\n", file_mode(&meta), meta.len(), name);
        send(stream, header.as_bytes()).await?;
        expect_ack(stream).await?;

        let mut file = tokio::fs::File::open(&path).await?;
        let sent = tokio::io::copy(&mut file, stream.get_mut()).await?;
        send(stream, b"\0").await?;
        expect_ack(stream).await?;
        info!("scp sent {} ({} bytes)", path.display(), sent);
        Ok(())
    }
}

struct FileHeader {
    size: u64,
    name: String,
}

impl FileHeader {
    /// Parse the part of a `C` line after the `C`: `<mode> <size> <name>`.
    fn parse(rest: &str) -> io::Result<Self> {
        let mut parts = rest.splitn(3, ' ');
        let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid(format!("bad file header {rest:?}")));
        };
        u32::from_str_radix(mode, 8).map_err(|_| invalid(format!("bad file mode {mode}")))?;
        let size = size
            .parse()
            .map_err(|_| invalid(format!("bad file size {size}")))?;
        if name.is_empty() || name.contains('/') || name == ".." {
            return Err(invalid(format!("bad file name {name:?}")));
        }
        Ok(Self {
            size,
            name: name.to_string(),
        })
    }
}

fn parse_times(rest: &str) -> io::Result<SystemTime> {
    let mtime: u64 = rest
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid(format!("bad time header {rest:?}")))?;
    Ok(UNIX_EPOCH + Duration::from_secs(mtime))
}

async fn receive_file<S>(
    stream: &mut BufReader<S>,
    path: &Path,
    size: u64,
    modified: Option<SystemTime>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::create(path).await?;
    let copied = tokio::io::copy(&mut (&mut *stream).take(size), &mut file).await?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed during transfer",
        ));
    }
    file.flush().await?;
    if let Some(modified) = modified {
        file.into_std().await.set_modified(modified)?;
    }
    debug!("scp wrote {}", path.display());
    Ok(())
}

async fn send<S>(stream: &mut BufReader<S>, bytes: &[u8]) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.get_mut().write_all(bytes).await?;
    stream.get_mut().flush().await
}

async fn ack<S>(stream: &mut BufReader<S>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send(stream, b"\0").await
}

async fn expect_ack<S>(stream: &mut BufReader<S>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.read_u8().await? {
        0 => Ok(()),
        _ => {
            let mut message = String::new();
            stream.read_line(&mut message).await?;
            Err(io::Error::other(format!("client error: {}", message.trim_end())))
        }
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn unsupported(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sink_and_source() {
        let cmd = ScpCommand::parse("scp -t /upload.txt").unwrap();
        assert_eq!(cmd.mode, ScpMode::Sink);
        assert_eq!(cmd.path, "/upload.txt");
        assert!(!cmd.preserve);

        let cmd = ScpCommand::parse("scp -p -f docs/report.csv").unwrap();
        assert_eq!(cmd.mode, ScpMode::Source);
        assert!(cmd.preserve);
        assert_eq!(cmd.path, "docs/report.csv");
    }

    #[test]
    fn parse_combined_flags() {
        let cmd = ScpCommand::parse("scp -vdt /incoming").unwrap();
        assert!(cmd.verbose);
        assert!(cmd.target_is_dir);
        assert_eq!(cmd.mode, ScpMode::Sink);
    }

    #[test]
    fn parse_end_of_options() {
        let cmd = ScpCommand::parse("scp -t -- -dash.txt").unwrap();
        assert_eq!(cmd.mode, ScpMode::Sink);
        assert_eq!(cmd.path, "-dash.txt");

        let cmd = ScpCommand::parse("scp -f -- --").unwrap();
        assert_eq!(cmd.path, "--");

        assert_eq!(ScpCommand::parse("scp -t --"), Err(ScpError::MissingTarget));
        assert_eq!(ScpCommand::parse("scp -- -t /x"), Err(ScpError::MissingMode));
    }

    #[test]
    fn parse_rejections() {
        assert_eq!(ScpCommand::parse("ls -la"), Err(ScpError::NotScp));
        assert_eq!(ScpCommand::parse("scp -r -t /x"), Err(ScpError::Recursive));
        assert_eq!(ScpCommand::parse("scp /x"), Err(ScpError::MissingMode));
        assert_eq!(ScpCommand::parse("scp -t"), Err(ScpError::MissingTarget));
        assert_eq!(ScpCommand::parse("scp -t -f /x"), Err(ScpError::MissingMode));
        assert_eq!(ScpCommand::parse("scp -q -t /x"), Err(ScpError::UnknownOption('q')));
    }

    #[tokio::test]
    async fn sink_writes_file_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = VirtualRoot::new(dir.path());
        let cmd = ScpCommand::parse("scp -t /").unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { cmd.serve(&root, server).await });

        assert_eq!(client.read_u8().await.unwrap(), 0);
        client.write_all(b"C0644 5 hello.txt\n").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        client.write_all(b"hello\0").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        drop(client);

        assert_eq!(task.await.unwrap(), 0);
        assert_eq!(std::fs::read(dir.path().join("hello.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn sink_preserves_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let root = VirtualRoot::new(dir.path());
        let cmd = ScpCommand::parse("scp -p -t /stamped.txt").unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { cmd.serve(&root, server).await });

        assert_eq!(client.read_u8().await.unwrap(), 0);
        client.write_all(b"T1000000000 0 1000000000 0\n").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        client.write_all(b"C0600 2 ignored\n").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        client.write_all(b"ok\0").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        drop(client);

        assert_eq!(task.await.unwrap(), 0);
        let meta = std::fs::metadata(dir.path().join("stamped.txt")).unwrap();
        assert_eq!(
            meta.modified().unwrap(),
            UNIX_EPOCH + Duration::from_secs(1_000_000_000)
        );
    }

    #[tokio::test]
    async fn sink_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = VirtualRoot::new(dir.path());
        let cmd = ScpCommand::parse("scp -t /").unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { cmd.serve(&root, server).await });

        assert_eq!(client.read_u8().await.unwrap(), 0);
        client.write_all(b"D0755 0 sub\n").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 1);
        assert_eq!(task.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn source_sends_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "payload").unwrap();
        let root = VirtualRoot::new(dir.path());
        let cmd = ScpCommand::parse("scp -f /data.txt").unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { cmd.serve(&root, server).await });
        let mut client = BufReader::new(client);

        client.get_mut().write_all(b"\0").await.unwrap();
        let mut header = String::new();
        client.read_line(&mut header).await.unwrap();
        assert!(header.starts_with('C'));
        assert!(header.ends_with(" 7 data.txt\n"));

        client.get_mut().write_all(b"\0").await.unwrap();
        let mut body = vec![0; 8];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"payload\0");
        client.get_mut().write_all(b"\0").await.unwrap();

        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn source_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = VirtualRoot::new(dir.path());
        let cmd = ScpCommand::parse("scp -f /missing").unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { cmd.serve(&root, server).await });
        let mut client = BufReader::new(client);

        client.get_mut().write_all(b"\0").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 1);
        let mut message = String::new();
        client.read_line(&mut message).await.unwrap();
        assert!(message.contains("/missing"));
        assert_eq!(task.await.unwrap(), 1);
    }
}
