//! Child-process helpers shared by the capture and finalize stages.

use std::ffi::OsStr;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` that never opens a console window and
/// whose child is killed when the handle is dropped.
pub fn tokio_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0.
    Success,
    /// Non-zero exit code.
    Failed(i32),
    /// Terminated by a signal (no exit code available).
    Signalled,
}

impl ExitKind {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<ExitStatus> for ExitKind {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => Self::Success,
            Some(code) => Self::Failed(code),
            None => Self::Signalled,
        }
    }
}

/// Kill `child` and wait up to `timeout` for it to be reaped.
///
/// Returns `None` when the child could not be reaped in time. Calling this on a
/// child that already exited just returns its status.
pub async fn terminate(child: &mut Child, timeout: Duration) -> Option<ExitKind> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status.into());
    }

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill signal not delivered, child probably exited");
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status.into()),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to wait for child process");
            None
        }
        Err(_) => {
            warn!(?timeout, "child process did not exit in time");
            None
        }
    }
}
