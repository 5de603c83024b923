//! Graceful shutdown for `tokio::process::Child` with SIGTERM → SIGKILL
//! escalation.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::time::timeout;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Gracefully shut down a child process, escalating to SIGKILL.
///
/// # Strategy
/// 1. Send SIGTERM and wait up to `grace` for a clean exit
/// 2. If still running, send SIGKILL
/// 3. Wait for process reaping (required to avoid zombies)
///
/// # Platform behavior
/// - Unix: nix SIGTERM, then SIGKILL via `Child::kill`
/// - Windows: immediate `Child::kill` (no graceful shutdown available)
pub async fn shutdown_child(mut child: Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        shutdown_unix(&mut child, grace).await
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        kill_inner(&mut child).await
    }
}

/// Skip the grace period entirely.
pub async fn kill_now(mut child: Child) -> io::Result<ExitStatus> {
    kill_inner(&mut child).await
}

#[cfg(unix)]
async fn shutdown_unix(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped by a previous wait
        return child.wait().await;
    };

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        // Process may have already exited
        if e == nix::errno::Errno::ESRCH {
            return child.wait().await;
        }
        return Err(io::Error::other(e));
    }

    match timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            // Grace expired, escalate
            kill_inner(child).await
        }
    }
}

async fn kill_inner(child: &mut Child) -> io::Result<ExitStatus> {
    child.kill().await?;
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;
    use tokio::time::sleep;

    #[tokio::test]
    #[cfg(unix)]
    async fn shutdown_responds_to_sigterm() {
        let child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep");

        let result = shutdown_child(child, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn shutdown_handles_already_exited() {
        let child = Command::new("echo")
            .arg("test")
            .spawn()
            .expect("failed to spawn echo");

        sleep(Duration::from_millis(100)).await;

        let result = shutdown_child(child, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn kill_now_reaps() {
        let child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep");

        let status = kill_now(child).await.unwrap();
        assert!(!status.success());
    }
}
