//! FTP over explicit TLS
//!
//! [`FtpsTestServer`] runs a small FTP command engine: enough of RFC 959,
//! RFC 2228 and RFC 4217 for a standard client to log in, list, upload
//! and download over passive data connections.

mod command;
mod data;
mod io;
mod listing;
mod policy;
mod server;
mod session;
mod tls;
mod user;

pub use policy::MAX_LOGINS;
pub use server::FtpsTestServer;
pub use tls::{KeystoreFormat, TlsMaterial};
pub use user::{Authority, User, UserStore, UserStoreError};
