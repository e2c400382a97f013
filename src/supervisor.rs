//! Starts, stops, and replaces the supervised backend process.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::logging;

/// Owns the single live backend child, if any.
///
/// Replacement is atomic: the old child is killed and reaped before the
/// new one is spawned, so two backends never coexist. There is no graceful
/// shutdown of the backend — SIGKILL, development only.
pub struct Supervisor {
    run_cmd: String,
    current: Mutex<Option<Child>>,
}

impl Supervisor {
    pub fn new(run_cmd: impl Into<String>) -> Self {
        Self {
            run_cmd: run_cmd.into(),
            current: Mutex::new(None),
        }
    }

    /// Spawns `sh -c <run_cmd>` with its output tagged `[backend] `.
    fn spawn_backend(&self) -> Result<Child> {
        info!(target: "backend", "starting application: {}", self.run_cmd);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.run_cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to start backend")?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(logging::pump_child_stream(stdout, "[backend] ".to_string()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(logging::pump_child_stream(stderr, "[backend] ".to_string()));
        }

        if let Some(pid) = child.id() {
            info!(target: "backend", "application started (pid {pid})");
        }
        Ok(child)
    }

    /// Stops the current backend (if any) and starts a new one.
    pub async fn restart(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        if let Some(child) = current.as_mut() {
            info!(target: "backend", "stopping existing backend");
            kill_and_reap(child).await;
        }
        *current = None;
        *current = Some(self.spawn_backend()?);
        Ok(())
    }

    /// Stops the backend if one is running; idempotent.
    pub async fn shutdown(&self) {
        let mut current = self.current.lock().await;
        if let Some(child) = current.as_mut() {
            info!(target: "backend", "stopping backend application");
            kill_and_reap(child).await;
        }
        *current = None;
    }

    pub async fn pid(&self) -> Option<u32> {
        self.current.lock().await.as_ref().and_then(Child::id)
    }
}

async fn kill_and_reap(child: &mut Child) {
    // kill() sends SIGKILL and waits for the exit to be reaped.
    if let Err(e) = child.kill().await {
        error!(target: "backend", "failed to kill backend: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::Supervisor;

    #[tokio::test]
    async fn restart_replaces_the_child() {
        let supervisor = Supervisor::new("sleep 30");

        supervisor.restart().await.expect("first start");
        let first_pid = supervisor.pid().await.expect("running");

        supervisor.restart().await.expect("replace");
        let second_pid = supervisor.pid().await.expect("running");
        assert_ne!(first_pid, second_pid);

        supervisor.shutdown().await;
        assert_eq!(supervisor.pid().await, None);
    }

    #[tokio::test]
    async fn shutdown_without_a_backend_is_a_no_op() {
        let supervisor = Supervisor::new("sleep 30");
        supervisor.shutdown().await;
        assert_eq!(supervisor.pid().await, None);
    }

    #[tokio::test]
    async fn shutdown_reaps_a_child_that_already_exited() {
        let supervisor = Supervisor::new("true");
        supervisor.restart().await.expect("start");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        supervisor.shutdown().await;
        assert_eq!(supervisor.pid().await, None);
    }
}
