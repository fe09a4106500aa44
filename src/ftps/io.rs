//! Control-channel helpers
//!
//! Replies are written straight to the inner stream and flushed, so a
//! client never waits on a buffered reply. Command lines are read with a
//! length cap.

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Longest accepted command line, terminator included.
pub const MAX_LINE_LEN: usize = 4096;

/// Read one command line into `line`.
///
/// Returns `Ok(0)` at end of stream and an [`io::ErrorKind::InvalidData`]
/// error once [`MAX_LINE_LEN`] bytes arrive without a line feed.
pub async fn read_command<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    line: &mut String,
) -> io::Result<usize> {
    let n = (&mut *stream)
        .take(MAX_LINE_LEN as u64)
        .read_line(line)
        .await?;
    if n == MAX_LINE_LEN && !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Command line too long",
        ));
    }
    Ok(n)
}

/// Write a string to the stream and flush.
pub async fn write_line<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    line: &str,
) -> io::Result<()> {
    stream.get_mut().write_all(line.as_bytes()).await?;
    stream.get_mut().flush().await
}

/// Write a single-line `<code> <text>` reply.
pub async fn reply<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    code: u16,
    text: &str,
) -> io::Result<()> {
    write_line(stream, &format!("{code} {text}\r\n")).await
}
