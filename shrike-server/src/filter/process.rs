use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use smtp::MessageHost;

use super::FilterError;

/// Which of the child's standard streams get pipes; the rest attach to
/// /dev/null so a filter can never reach the daemon's own terminal.
pub struct Pipes {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// Launches the filter command under `/bin/sh -c`, with the session's
/// envelope published through the environment. The command string keeps
/// full shell semantics on purpose; no argument splitting happens here.
pub fn spawn<H: MessageHost>(host: &H, command: &str, pipes: Pipes) -> Result<Child, FilterError> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd.stdin(stdio(pipes.stdin));
    cmd.stdout(stdio(pipes.stdout));
    cmd.stderr(stdio(pipes.stderr));
    // Backstop for panics; normal paths always reap explicitly.
    cmd.kill_on_drop(true);
    for (key, value) in host.filter_env() {
        cmd.env(key, value);
    }
    let child = cmd.spawn().map_err(FilterError::Spawn)?;
    debug!(pid = child.id(), command, "executed filter command");
    Ok(child)
}

fn stdio(piped: bool) -> Stdio {
    if piped {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Waits for the child to exit within the deadline.
pub async fn wait(child: &mut Child, deadline: Duration) -> Result<ExitStatus, FilterError> {
    match timeout(deadline, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            warn!("timeout waiting for filter command to exit");
            Err(FilterError::Timeout)
        }
    }
}

/// Best-effort graceful termination: SIGTERM, a bounded wait, then SIGKILL.
/// A child that is already gone counts as terminated.
pub async fn terminate(child: &mut Child, deadline: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    warn!(pid, "killing filter process");
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    if timeout(deadline, child.wait()).await.is_ok() {
        return;
    }
    error!(pid, "filter process wouldn't quit, forcing termination");
    let _ = child.start_kill();
    let _ = timeout(deadline, child.wait()).await;
}
