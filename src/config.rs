//! Fixture configuration
//!
//! FTPS fixtures are usually described by a small properties resource:
//!
//! ```text
//! ftp.port=2221
//! ftp.user=ftptest
//! ftp.password=secret
//! ftp.homedir=target/ftp-home
//! keystore.type=PEM
//! keystore.file=ftpserver.pem
//! keystore.password=changeit
//! ```
//!
//! Values are taken literally: `$` and embedded spaces are kept, as in
//! Java properties files. Resources and keystore files are looked up on
//! a [`ResourcePath`].

use crate::auth::Account;
use crate::error::{Error, Result};
use crate::ftps::{FtpsTestServer, KeystoreFormat, TlsMaterial};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Path-list variable prepended to the resource search path.
pub const RESOURCE_PATH_ENV: &str = "FIXTURE_RESOURCE_PATH";

/// FTPS bind host when `ftp.server` is absent.
pub const DEFAULT_FTPS_HOST: &str = "127.0.0.1";

/// Directories searched for configuration resources and keystores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    dirs: Vec<PathBuf>,
}

impl ResourcePath {
    #[must_use]
    pub const fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// `FIXTURE_RESOURCE_PATH` entries, then `tests/resources`,
    /// `resources` and the working directory.
    ///
    /// A `.env` file in the working directory is loaded first.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut dirs: Vec<PathBuf> = env::var_os(RESOURCE_PATH_ENV)
            .map(|paths| env::split_paths(&paths).collect())
            .unwrap_or_default();
        dirs.extend([
            PathBuf::from("tests/resources"),
            PathBuf::from("resources"),
            PathBuf::from("."),
        ]);
        Self { dirs }
    }

    #[must_use]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Absolute path of the first file called `name` on the search path.
    ///
    /// An absolute `name` is returned as is when the file exists.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let name = Path::new(name);
        if name.is_absolute() {
            return name.is_file().then(|| name.to_path_buf());
        }
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .and_then(|found| std::path::absolute(found).ok())
    }
}

impl Default for ResourcePath {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Everything needed to build an [`FtpsTestServer`].
#[derive(Debug, Clone)]
pub struct FtpsConfig {
    pub host: String,
    pub port: u16,
    pub account: Account,
    pub root_directory: PathBuf,
    pub tls: TlsMaterial,
}

impl FtpsConfig {
    /// A configuration bound to [`DEFAULT_FTPS_HOST`].
    #[must_use]
    pub fn new(
        port: u16,
        account: Account,
        root_directory: impl Into<PathBuf>,
        tls: TlsMaterial,
    ) -> Self {
        Self {
            host: DEFAULT_FTPS_HOST.to_string(),
            port,
            account,
            root_directory: root_directory.into(),
            tls,
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Build a configuration from `ftp.*` and `keystore.*` properties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a missing key, an unparsable port,
    /// an unsupported keystore type, or a keystore file that is not on
    /// `resources`.
    pub fn from_properties(
        props: &HashMap<String, String>,
        resources: &ResourcePath,
    ) -> Result<Self> {
        let required = |key: &str| {
            props
                .get(key)
                .map(|value| value.trim())
                .ok_or_else(|| Error::config(format!("Missing property {key}")))
        };

        let port = required("ftp.port")?
            .parse()
            .map_err(|e| Error::config_with("Invalid ftp.port", e))?;
        let account = Account::with_password(required("ftp.user")?, required("ftp.password")?);
        let root_directory = PathBuf::from(required("ftp.homedir")?);
        let format: KeystoreFormat = required("keystore.type")?.parse()?;

        let keystore = required("keystore.file")?;
        let keystore_path = resources.find(keystore).ok_or_else(|| {
            Error::config(format!(
                "Could not find the keystore file {keystore} on {:?}",
                resources.dirs()
            ))
        })?;
        let tls = TlsMaterial::new(format, keystore_path, required("keystore.password")?);

        let host = props
            .get("ftp.server")
            .map_or(DEFAULT_FTPS_HOST, |h| h.trim());

        Ok(Self::new(port, account, root_directory, tls).with_host(host))
    }

    /// Locate the properties resource `name` and build a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the resource cannot be found or read,
    /// or for any failure listed on [`from_properties`](Self::from_properties).
    pub fn from_resource(resources: &ResourcePath, name: &str) -> Result<Self> {
        let path = resources.find(name).ok_or_else(|| {
            Error::config(format!(
                "Could not find resource {name} on {:?}",
                resources.dirs()
            ))
        })?;
        debug!("Loading FTPS configuration from {}", path.display());
        Self::from_properties(&read_properties(&path)?, resources)
    }
}

fn read_properties(path: &Path) -> Result<HashMap<String, String>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::config_with(format!("Could not read {}", path.display()), e))?;
    Ok(parse_properties(&text))
}

/// Parse Java-style properties text.
///
/// Lines starting with `#` or `!` are comments. A key ends at the first
/// unescaped `=`, `:` or whitespace. A trailing backslash continues the
/// value on the next line.
fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let mut logical = line.to_string();
        while ends_with_continuation(&logical) {
            logical.pop();
            match lines.next() {
                Some(next) => logical.push_str(next.trim_start()),
                None => break,
            }
        }
        let (key, value) = split_entry(&logical);
        props.insert(unescape(key), unescape(value));
    }
    props
}

fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

fn split_entry(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '=' || c == ':' || c.is_whitespace() {
            let key = &line[..i];
            let mut rest = line[i..].trim_start();
            if c.is_whitespace() {
                if let Some(stripped) = rest.strip_prefix(['=', ':']) {
                    rest = stripped.trim_start();
                }
            } else {
                rest = rest[1..].trim_start();
            }
            return (key, rest);
        }
    }
    (line, "")
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Build an [`FtpsTestServer`] from the properties resource `name`,
/// searched on the default [`ResourcePath`].
///
/// # Errors
///
/// Returns [`Error::Config`] if the resource is missing or invalid, or
/// the fixture cannot be constructed from it.
pub fn create_test_ftps_server(name: &str) -> Result<FtpsTestServer> {
    create_test_ftps_server_with(&ResourcePath::from_env(), name)
}

/// Like [`create_test_ftps_server`] with an explicit search path.
///
/// # Errors
///
/// See [`create_test_ftps_server`].
pub fn create_test_ftps_server_with(
    resources: &ResourcePath,
    name: &str,
) -> Result<FtpsTestServer> {
    FtpsConfig::from_resource(resources, name)
        .and_then(FtpsTestServer::new)
        .inspect_err(|e| error!("Unable to configure FtpsTestServer: {}", e.chain()))
}

/// Defaults and overrides for an SFTP fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub root_directory: PathBuf,
    pub host_key_path: PathBuf,
}

impl SftpConfig {
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const DEFAULT_PORT: u16 = 22;
    pub const DEFAULT_USER: &'static str = "fccitest";
    pub const HOST_KEY_FILE: &'static str = "hostkey.ser";
    pub const ROOT_DIR_NAME: &'static str = "sftp-test";

    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            root_directory: env::temp_dir().join(Self::ROOT_DIR_NAME),
            host_key_path: PathBuf::from(Self::HOST_KEY_FILE),
        }
    }

    #[must_use]
    pub fn with_root_directory(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_directory = root.into();
        self
    }

    #[must_use]
    pub fn with_host_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_key_path = path.into();
        self
    }
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HOST, Self::DEFAULT_PORT, Self::DEFAULT_USER)
    }
}
