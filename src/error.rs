//! Error types for ftp-test-fixtures

use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Could not start {server} server: {source}")]
    Start {
        server: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not stop {server} server: {source}")]
    Stop {
        server: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("{0} server is already running")]
    AlreadyRunning(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),
}

impl Error {
    /// A configuration error with no underlying cause.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// A configuration error wrapping the failure that caused it.
    #[must_use]
    pub fn config_with(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Displays this error followed by every underlying cause.
    #[must_use]
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

/// `outer: cause: root cause`, skipping causes the outer message already
/// ends with.
pub struct Chain<'a>(&'a (dyn std::error::Error + 'static));

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut last = self.0.to_string();
        f.write_str(&last)?;
        let mut cause = self.0.source();
        while let Some(err) = cause {
            let text = err.to_string();
            if !last.ends_with(&text) {
                write!(f, ": {text}")?;
            }
            last = text;
            cause = err.source();
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn config_without_cause() {
        let err = Error::config("ftp.port not set");
        assert_eq!(err.to_string(), "Configuration error: ftp.port not set");
        assert!(err.source().is_none());
    }

    #[test]
    fn config_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::config_with("Could not read keystore", io);
        assert_eq!(err.source().unwrap().to_string(), "gone");
    }

    #[test]
    fn chain_shows_every_cause() {
        let inner = Error::config_with(
            "Invalid ftp.port",
            "70000".parse::<u16>().unwrap_err(),
        );
        let outer = Error::config_with("Could not load fixture.properties", inner);
        assert_eq!(
            outer.chain().to_string(),
            "Configuration error: Could not load fixture.properties: \
             Configuration error: Invalid ftp.port: \
             number too large to fit in target type"
        );
    }

    #[test]
    fn chain_does_not_repeat_inline_cause() {
        let err = Error::Start {
            server: "FTPS",
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.chain().to_string(), "Could not start FTPS server: in use");
    }

    #[test]
    fn start_names_the_server() {
        let err = Error::Start {
            server: "SFTP",
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "Could not start SFTP server: in use");
    }
}
