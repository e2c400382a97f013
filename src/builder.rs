//! Build execution: the sequential startup pass over every rule, and the
//! per-rule abortable rebuilds the watcher triggers.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BuildRule, Config};
use crate::logging;
use crate::tracker::BuildTracker;

struct RunningBuild {
    cancel: CancellationToken,
    runner: JoinHandle<()>,
}

/// Runs rule commands as `sh -c` children.
///
/// Different rules may build in parallel; the same rule never does. A new
/// trigger for a rule cancels the in-flight build, waits until its aborted
/// marker is on disk, and only then starts the replacement. Triggers are
/// serialized per rule name, never across rules.
#[derive(Clone)]
pub struct BuildExecutor {
    config: Arc<Config>,
    running: Arc<Mutex<HashMap<String, RunningBuild>>>,
    rule_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    on_success: mpsc::Sender<()>,
}

impl BuildExecutor {
    /// `on_success` receives one message per successful triggered build,
    /// strictly after the success marker is written.
    pub fn new(config: Arc<Config>, on_success: mpsc::Sender<()>) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
            rule_locks: Arc::new(Mutex::new(HashMap::new())),
            on_success,
        }
    }

    async fn rule_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.rule_locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Startup pass: every rule sequentially, in declaration order, under
    /// a single build id. Stops at the first failure. Does not notify
    /// `on_success`; the coordinator starts the backend itself.
    pub async fn run_all(&self) -> Result<()> {
        let tracker = BuildTracker::start(&self.config.build_status_dir)
            .await
            .context("failed to start build tracking")?;

        if let Err(e) = self.run_rules_sequentially().await {
            if let Err(mark) = tracker.fail().await {
                warn!(target: "build", "failed to mark build as failed: {mark}");
            }
            return Err(e);
        }

        if let Err(e) = tracker.complete().await {
            warn!(target: "build", "failed to record build completion: {e}");
        }
        Ok(())
    }

    async fn run_rules_sequentially(&self) -> Result<()> {
        for rule in &self.config.build_rules {
            info!(target: "build", "running build: {}", rule.name);
            let status = run_shell(&rule.command, "[build] ")
                .with_context(|| format!("failed to start build ({})", rule.name))?
                .wait()
                .await
                .with_context(|| format!("failed to wait for build ({})", rule.name))?;
            if !status.success() {
                bail!("build failed ({}): {status}", rule.name);
            }
            info!(target: "build", "build completed: {}", rule.name);
        }
        Ok(())
    }

    /// Debounced entry point: aborts any in-flight build for this rule,
    /// then starts the replacement.
    pub async fn trigger(&self, rule: &BuildRule) {
        // One trigger at a time per rule name; the shared running map is
        // only locked for the removal and the insert, so aborting this
        // rule's old build never blocks another rule's trigger.
        let slot = self.rule_lock(&rule.name).await;
        let _slot_guard = slot.lock().await;

        info!(target: "watcher", "triggering build: {}", rule.name);

        let previous = self.running.lock().await.remove(&rule.name);
        if let Some(previous) = previous {
            if !previous.runner.is_finished() {
                info!(target: "watcher", "aborting previous build: {}", rule.name);
            }
            previous.cancel.cancel();
            // The runner writes the aborted marker before it exits; waiting
            // here, still under the rule lock, puts the abort on disk
            // before the replacement's building marker.
            let _ = previous.runner.await;
        }

        let tracker = match BuildTracker::start(&self.config.build_status_dir).await {
            Ok(tracker) => tracker,
            Err(e) => {
                error!(target: "watcher", "failed to start build tracking: {e}");
                return;
            }
        };

        let cancel = CancellationToken::new();
        let runner = tokio::spawn(run_build(
            self.clone(),
            rule.clone(),
            tracker,
            cancel.clone(),
        ));
        self.running
            .lock()
            .await
            .insert(rule.name.clone(), RunningBuild { cancel, runner });
    }

    /// Aborts every in-flight build; used at watcher shutdown.
    pub async fn stop_all(&self) {
        let mut running = self.running.lock().await;
        for (name, build) in running.drain() {
            if !build.runner.is_finished() {
                info!(target: "watcher", "aborting build: {name}");
            }
            build.cancel.cancel();
            let _ = build.runner.await;
        }
    }
}

async fn run_build(
    executor: BuildExecutor,
    rule: BuildRule,
    tracker: BuildTracker,
    cancel: CancellationToken,
) {
    let prefix = format!("[build:{}] ", rule.name);
    let mut child = match run_shell(&rule.command, &prefix) {
        Ok(child) => child,
        Err(e) => {
            error!(target: "watcher", "failed to start build {}: {e}", rule.name);
            if let Err(mark) = tracker.fail().await {
                warn!(target: "build", "failed to mark build as failed: {mark}");
            }
            return;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            if let Err(e) = tracker.abort().await {
                warn!(target: "build", "failed to mark build as aborted: {e}");
            }
            info!(target: "watcher", "aborted build: {}", rule.name);
        }
        status = child.wait() => match status {
            Ok(_) if cancel.is_cancelled() => {
                // Cancelled in the same instant the child exited; the
                // cancellation wins regardless of the exit status.
                if let Err(e) = tracker.abort().await {
                    warn!(target: "build", "failed to mark build as aborted: {e}");
                }
            }
            Ok(status) if status.success() => {
                info!(target: "watcher", "build completed: {}", rule.name);
                if let Err(e) = tracker.complete().await {
                    warn!(target: "build", "failed to record build completion: {e}");
                }
                let _ = executor.on_success.send(()).await;
            }
            Ok(status) => {
                if killed_by_abort_signal(&status) {
                    // Killed from outside the executor; whoever killed it
                    // owns the bookkeeping. Not a failure.
                    return;
                }
                error!(target: "watcher", "build failed: {} ({status})", rule.name);
                if let Err(e) = tracker.fail().await {
                    warn!(target: "build", "failed to mark build as failed: {e}");
                }
            }
            Err(e) => {
                error!(target: "watcher", "failed to wait for build {}: {e}", rule.name);
                if let Err(mark) = tracker.fail().await {
                    warn!(target: "build", "failed to mark build as failed: {mark}");
                }
            }
        }
    }
}

fn run_shell(command: &str, prefix: &str) -> Result<Child> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn sh")?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(logging::pump_child_stream(stdout, prefix.to_string()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(logging::pump_child_stream(stderr, prefix.to_string()));
    }
    Ok(child)
}

/// True when the exit status says the child died to SIGKILL or SIGTERM.
/// The executor's own aborts are tracked by the cancellation token; this
/// only classifies kills that came from elsewhere.
fn killed_by_abort_signal(status: &std::process::ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;
        use std::os::unix::process::ExitStatusExt;
        matches!(
            status.signal(),
            Some(sig) if sig == Signal::SIGKILL as i32 || sig == Signal::SIGTERM as i32
        )
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        false
    }
}
