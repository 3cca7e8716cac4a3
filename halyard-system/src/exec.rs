//! External command invocation shared by the kernel backends.

use halyard_core::error::{Error, Result};
use std::ffi::OsStr;
use tokio::process::Command;
use tracing::trace;

/// Run a command to completion and return its stdout.
///
/// A nonzero exit becomes [`Error::Command`] carrying the trimmed stderr;
/// a spawn failure surfaces as [`Error::Io`].
pub(crate) async fn run<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    trace!(program, "invoking");
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(Error::Command {
            program: program.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
