//! Cross-platform process spawning helpers.
//!
//! On Windows, spawning console binaries (vips, converters, etc.) from a
//! service can cause a console window to appear for each invocation.
//! This module centralizes the Windows creation flags needed to suppress that,
//! and the graceful-then-forced termination used for cancelled stages.

use std::time::Duration;

use tokio::process::Child;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Apply platform-specific flags to a tokio process command.
pub fn configure_tokio_command(cmd: &mut tokio::process::Command) {
    #[cfg(target_os = "windows")]
    {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    let _ = cmd;
}

/// Terminates a child process, politely first.
///
/// On unix the child receives SIGTERM and gets `grace` to exit before it is
/// killed. Elsewhere it is killed immediately. Always reaps the child.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            #[allow(clippy::cast_possible_wrap)]
            let target = Pid::from_raw(pid as i32);
            if kill(target, Signal::SIGTERM).is_ok() {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => {
                        tracing::debug!(pid, status = ?status.as_ref().ok(), "Process exited after SIGTERM");
                        return status.map(|_| ());
                    }
                    Err(_) => {
                        tracing::warn!(
                            pid,
                            grace_ms = grace.as_millis() as u64,
                            "Process ignored SIGTERM, killing"
                        );
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    match child.kill().await {
        Ok(()) => Ok(()),
        // Already exited and reaped.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e),
    }
}
