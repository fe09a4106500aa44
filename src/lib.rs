//! In-process FTPS and SFTP server fixtures
//!
//! Stand up an ephemeral file-transfer endpoint backed by a real
//! directory, point a client at it, and tear it down afterwards:
//!
//! - [`FtpsTestServer`]: FTP with explicit TLS (`AUTH TLS`), one user,
//!   configured directly or from a properties resource via
//!   [`create_test_ftps_server`].
//! - [`SftpTestServer`]: SSH with the `sftp` subsystem and SCP, accepting
//!   any credential for one username.
//!
//! Both fixtures are async: `start_server` binds and spawns an accept
//! loop on the current tokio runtime, `stop_server` releases the port.
//!
//! The [`integration`] module runs external programs from tests and
//! detects whether coverage is being collected.

mod auth;
mod config;
mod error;
mod ftps;
pub mod integration;
mod listener;
mod sftp;
mod vfs;

pub use auth::{Account, Authenticator, InsecureTestAuthenticator, Proof};
pub use config::{
    DEFAULT_FTPS_HOST, FtpsConfig, RESOURCE_PATH_ENV, ResourcePath, SftpConfig,
    create_test_ftps_server, create_test_ftps_server_with,
};
pub use error::{Chain, Error, Result};
pub use ftps::{
    Authority, FtpsTestServer, KeystoreFormat, MAX_LOGINS, TlsMaterial, User, UserStore,
    UserStoreError,
};
pub use listener::{ServerHandle, Service};
pub use sftp::{FixtureInfo, SERVER_ID, ScpCommand, ScpError, ScpMode, SftpHandler, SftpTestServer};
pub use vfs::VirtualRoot;
