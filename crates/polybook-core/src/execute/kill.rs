//! Subprocess spawning and termination helpers.
//!
//! On Unix every child is placed in its own process group so that
//! termination also reaches anything the user's program spawned.

use std::process::Stdio;

use tokio::process::{Child, Command};

/// Build a command with piped stdio that dies with its handle.
pub fn piped_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Kill a child (and its process group) and reap it.
///
/// Safe to call on a child that has already exited.
pub async fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SIGKILL for immediate termination of the whole group
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }

    if let Err(e) = child.kill().await {
        tracing::debug!("kill after group termination: {}", e);
    }
}
