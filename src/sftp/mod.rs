//! SFTP and SCP over SSH
//!
//! [`SftpTestServer`] serves the `sftp` subsystem and `scp -t`/`scp -f`
//! exec requests from one root directory, with a throwaway host key and
//! lenient test-only authentication.

mod filesystem;
mod hostkey;
mod scp;
mod server;
mod session;

pub use filesystem::SftpHandler;
pub use scp::{ScpCommand, ScpError, ScpMode};
pub use server::{FixtureInfo, SERVER_ID, SftpTestServer};
