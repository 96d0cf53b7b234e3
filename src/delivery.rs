//! Token delivery: hand the minted JIT config to its destination.
//!
//! The token is a live credential, so delivery is deliberately narrow:
//! stdout for process-local handoff (the default), an owner-only file
//! written atomically, or direct handoff as an argument to the runner
//! binary. Partial writes never happen; a file destination either keeps
//! its previous content or receives the complete token.

use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::github::RunnerRegistrationToken;

/// Where the minted token goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Print the encoded JIT config to stdout (logs go to stderr)
    Stdout,

    /// Write the encoded JIT config to a file, mode 0600, atomically
    File { path: PathBuf },

    /// Launch the runner binary with `--jitconfig <token>` and wait for it
    RunnerProcess { program: PathBuf, args: Vec<String> },
}

/// Deliver the token to its destination.
pub async fn deliver(token: &RunnerRegistrationToken, destination: &Destination) -> Result<()> {
    match destination {
        Destination::Stdout => {
            // The token is the only thing this tool ever writes to stdout,
            // so callers can capture it with a plain pipe.
            println!("{}", token.encoded());
            Ok(())
        }
        Destination::File { path } => write_file_atomic(token, path),
        Destination::RunnerProcess { program, args } => launch_runner(token, program, args).await,
    }
}

/// Write the token to `path` via a same-directory temp file and rename.
///
/// The temp file gets owner-only permissions before any token bytes are
/// written, so the token is never readable more broadly than the final
/// file. If anything fails, the previous file content is untouched.
fn write_file_atomic(token: &RunnerRegistrationToken, path: &std::path::Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        // Bare filename: the temp file goes in the working directory
        _ => std::path::Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        Error::delivery(format!(
            "failed to create temp file in {}: {e}",
            parent.display()
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(tmp.path(), perms)
            .map_err(|e| Error::delivery(format!("failed to set permissions: {e}")))?;
    }

    tmp.write_all(token.encoded().as_bytes())
        .and_then(|_| tmp.write_all(b"\n"))
        .and_then(|_| tmp.flush())
        .map_err(|e| Error::delivery(format!("failed to write token: {e}")))?;

    tmp.persist(path).map_err(|e| {
        Error::delivery(format!("failed to move token into {}: {e}", path.display()))
    })?;

    info!("JIT config written to {}", path.display());
    Ok(())
}

/// Hand the token straight to the runner binary and wait for it to exit.
async fn launch_runner(
    token: &RunnerRegistrationToken,
    program: &std::path::Path,
    args: &[String],
) -> Result<()> {
    debug!("Launching runner: {}", program.display());

    let status = tokio::process::Command::new(program)
        .args(args)
        .arg("--jitconfig")
        .arg(token.encoded())
        .status()
        .await
        .map_err(|e| Error::delivery(format!("failed to launch {}: {e}", program.display())))?;

    if !status.success() {
        return Err(Error::delivery(format!(
            "runner process exited with {status}"
        )));
    }

    info!("Runner process completed");
    Ok(())
}
