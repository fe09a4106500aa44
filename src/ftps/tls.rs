//! Keystore loading for the FTPS listener

use crate::error::{Error, Result};
use pkcs8::EncryptedPrivateKeyInfo;
use rustls::ServerConfig;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Keystore file formats.
///
/// Only PEM keystores can be loaded: the file holds the certificate chain
/// followed by a private key. An `ENCRYPTED PRIVATE KEY` block (PKCS#8
/// with PBES2) is decrypted with the keystore password. Java keystore names are
/// recognised so configuration carried over from JVM projects fails with
/// a clear message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreFormat {
    Pem,
}

impl FromStr for KeystoreFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PEM" => Ok(Self::Pem),
            "JKS" | "JCEKS" | "PKCS12" | "P12" => Err(Error::config(format!(
                "Unsupported keystore type {s}: convert the keystore to PEM"
            ))),
            _ => Err(Error::config(format!("Unknown keystore type: {s}"))),
        }
    }
}

/// TLS identity for the FTPS listener.
#[derive(Clone)]
pub struct TlsMaterial {
    pub format: KeystoreFormat,
    pub path: PathBuf,
    pub password: String,
}

impl TlsMaterial {
    #[must_use]
    pub fn new(
        format: KeystoreFormat,
        path: impl Into<PathBuf>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            format,
            path: path.into(),
            password: password.into(),
        }
    }

    /// Read the keystore and build a rustls server configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, holds no
    /// usable certificate and private key, or its encrypted key does not
    /// decrypt with `password`.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            Error::config_with(
                format!("Could not read keystore file {}", self.path.display()),
                e,
            )
        })?;

        match self.format {
            KeystoreFormat::Pem => pem_server_config(&bytes, &self.path, &self.password),
        }
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("format", &self.format)
            .field("path", &self.path)
            .field("password", &"<redacted>")
            .finish()
    }
}

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

fn pem_server_config(pem: &[u8], path: &Path, password: &str) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::config_with(format!("Invalid certificate in keystore {}", path.display()), e)
        })?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "No certificate found in keystore {}",
            path.display()
        )));
    }

    let key = match encrypted_key(pem, path, password)? {
        Some(key) => key,
        None => rustls_pemfile::private_key(&mut &pem[..])
            .map_err(|e| {
                Error::config_with(format!("Invalid private key in keystore {}", path.display()), e)
            })?
            .ok_or_else(|| {
                Error::config(format!("No private key found in keystore {}", path.display()))
            })?,
    };

    debug!(
        "Loaded {} certificate(s) from keystore {}",
        certs.len(),
        path.display()
    );

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config_with("Unsupported TLS protocol versions", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| {
            Error::config_with(
                format!("Keystore {} holds no usable key pair", path.display()),
                e,
            )
        })?;

    Ok(Arc::new(config))
}

/// Decrypt the first `ENCRYPTED PRIVATE KEY` block, if the keystore has one.
fn encrypted_key(
    pem: &[u8],
    path: &Path,
    password: &str,
) -> Result<Option<PrivateKeyDer<'static>>> {
    let text = String::from_utf8_lossy(pem);
    let begin = format!("-----BEGIN {ENCRYPTED_KEY_LABEL}-----");
    let end = format!("-----END {ENCRYPTED_KEY_LABEL}-----");
    let Some(start) = text.find(&begin) else {
        return Ok(None);
    };
    let stop = text[start..]
        .find(&end)
        .map(|offset| start + offset + end.len())
        .ok_or_else(|| {
            Error::config(format!(
                "Unterminated encrypted private key in keystore {}",
                path.display()
            ))
        })?;

    let invalid = |e: pkcs8::Error| {
        Error::config_with(
            format!("Invalid encrypted private key in keystore {}", path.display()),
            e,
        )
    };
    let (_, document) = pkcs8::Document::from_pem(&text[start..stop])
        .map_err(|e| invalid(pkcs8::Error::from(e)))?;
    let info = EncryptedPrivateKeyInfo::try_from(document.as_bytes()).map_err(invalid)?;
    let decrypted = info.decrypt(password).map_err(|e| {
        Error::config_with(
            format!(
                "Could not decrypt private key in keystore {} (wrong password?)",
                path.display()
            ),
            e,
        )
    })?;

    debug!("Decrypted private key from keystore {}", path.display());
    Ok(Some(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    ))))
}
