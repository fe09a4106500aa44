//! Account and authentication policies
//!
//! Fixtures register exactly one [`Account`]. How a presented credential
//! is checked against it is decided by an [`Authenticator`], so the
//! protocol layers never compare secrets themselves.

use std::fmt;
use tracing::info;

/// The single account a fixture serves.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    /// Password, or `None` for key-based accounts.
    pub secret: Option<String>,
}

impl Account {
    #[must_use]
    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Some(password.into()),
        }
    }

    #[must_use]
    pub fn key_based(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: None,
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// What a client presented when authenticating.
#[derive(Debug, Clone, Copy)]
pub enum Proof<'a> {
    Password(&'a str),
    /// Wire-encoded public key blob.
    PublicKey(&'a [u8]),
}

/// Decides whether a username/proof pair may log in.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: &str, proof: Proof<'_>) -> bool;
}

/// Accepts any password or key for one username.
///
/// **Test use only.** The presented secret is never inspected: the only
/// check is an exact, case-sensitive comparison of the username.
#[derive(Debug, Clone)]
pub struct InsecureTestAuthenticator {
    username: String,
}

impl InsecureTestAuthenticator {
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Authenticator for InsecureTestAuthenticator {
    fn authenticate(&self, username: &str, proof: Proof<'_>) -> bool {
        match proof {
            Proof::Password(_) => info!("Authenticating user {}", username),
            Proof::PublicKey(_) => info!("Authenticating user {} and public key", username),
        }
        username == self.username
    }
}
