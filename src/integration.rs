//! Helpers for tests that drive an external program
//!
//! Coverage for child processes is collected through LLVM's source-based
//! instrumentation: when `cargo llvm-cov` runs the test suite it exports
//! `LLVM_PROFILE_FILE`, and instrumented children inherit it.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::path::Path;
use tracing::{debug, error, info};

/// Environment variable carrying the coverage profile pattern.
pub const COVERAGE_ENV: &str = "LLVM_PROFILE_FILE";

/// The coverage setting of the current process, if any.
#[must_use]
pub fn fetch_coverage_agent() -> Option<String> {
    let agent = coverage_agent_from(std::env::vars_os());
    match &agent {
        Some(agent) => info!("Coverage agent = {}", agent),
        None => info!("No coverage agent was detected. Code coverage will not be performed."),
    }
    agent
}

/// Find the coverage setting in an environment snapshot.
#[must_use]
pub fn coverage_agent_from<I>(vars: I) -> Option<String>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .find(|(key, _)| key == COVERAGE_ENV)
        .map(|(_, value)| value.to_string_lossy().into_owned())
        .filter(|value| !value.trim().is_empty())
}

/// Run `command` (program followed by its arguments) in `working_dir`
/// and return its exit code.
///
/// Standard output is logged at info level and standard error, when not
/// blank, at error level. A child killed by a signal reports `-1`.
///
/// # Errors
///
/// Returns [`Error::Config`] for an empty command and [`Error::Io`] if
/// the program cannot be started.
pub async fn run_integration_test(command: &[String], working_dir: &Path) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        return Err(Error::config("Integration test command is empty"));
    };

    debug!("Running {:?} in {}", command, working_dir.display());
    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .output()
        .await
        .inspect_err(|e| error!("Could not run {}: {}", program, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    info!("stdout:\n{}", stdout.trim_end());
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        error!("stderr:\n{}", stderr.trim_end());
    }

    Ok(output.status.code().unwrap_or(-1))
}
