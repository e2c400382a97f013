//! # devloop
//!
//! devloop collapses the edit → rebuild → restart → refresh cycle for a
//! long-running backend into one supervised loop. It watches the source
//! tree, rebuilds when matching files change, restarts the backend, and
//! pushes browser reloads when the backend comes back up. A reverse proxy
//! absorbs requests during downtime and serves a waiting page.
//!
//! ## Lifecycle
//!
//! 1. **Startup**: bind the proxy listener, start the liveness monitor,
//!    run every build rule once, start the backend.
//! 2. **Event loop**: the watcher debounces file changes into per-rule
//!    builds; a successful build replaces the backend; the monitor sees it
//!    come up and broadcasts a reload.
//! 3. **Shutdown**: on SIGINT/SIGTERM, stop the watcher and its builds,
//!    kill the backend, stop the monitor, and clean up the status
//!    directory unless `--debug` asked to keep it.
//!
//! Development only: loopback binding, SIGKILL process replacement, no
//! authentication.

#![warn(clippy::await_holding_lock)]
#![warn(unreachable_pub)]

pub mod builder;
pub mod cli;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod pattern;
pub mod proxy;
pub mod reload;
pub mod supervisor;
pub mod tracker;
pub mod watcher;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::builder::BuildExecutor;
use crate::config::Config;
use crate::monitor::LivenessMonitor;
use crate::reload::ReloadBus;
use crate::supervisor::Supervisor;
use crate::watcher::FileWatcher;

/// Boots every component, runs until a shutdown signal, then tears down in
/// order: watcher (and its in-flight builds), backend, monitor, listener.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);

    // The HTTP surface comes first: a bind failure is fatal before
    // anything else spawns.
    let listener = proxy::bind(config.proxy_port).await?;

    let bus = ReloadBus::new();
    let monitor = Arc::new(LivenessMonitor::new(config.backend_port, bus.clone()));

    let app = proxy::router(&config, Arc::clone(&monitor), bus);
    let server = tokio::spawn(async move {
        if let Err(e) = proxy::serve(listener, app).await {
            error!(target: "proxy", "server error: {e}");
        }
    });

    let monitor_cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&monitor).run(monitor_cancel.clone()));

    let (success_tx, mut success_rx) = mpsc::channel::<()>(16);
    let executor = BuildExecutor::new(Arc::clone(&config), success_tx);
    let supervisor = Arc::new(Supervisor::new(config.run_cmd.clone()));

    // Initial full build, sequentially in declaration order. A failure
    // keeps the proxy alive; the watcher rebuilds on the next change.
    match executor.run_all().await {
        Ok(()) => {
            info!(target: "proxy", "initial build completed successfully");
            if let Err(e) = supervisor.restart().await {
                error!(target: "proxy", "failed to start backend: {e}");
                info!(target: "proxy", "backend will start after the next successful build");
            }
        }
        Err(e) => {
            error!(target: "proxy", "initial build failed: {e}");
            info!(target: "proxy", "proxy keeps running; fix the build errors and the watcher will rebuild");
        }
    }

    // Successful rebuilds replace the backend. The monitor notices the new
    // process come up and publishes the browser reload on its own.
    let restarter = Arc::clone(&supervisor);
    tokio::spawn(async move {
        while success_rx.recv().await.is_some() {
            info!(target: "proxy", "build succeeded, starting/restarting backend");
            if let Err(e) = restarter.restart().await {
                error!(target: "proxy", "failed to start backend: {e}");
            }
        }
    });

    let watcher = FileWatcher::new(Arc::clone(&config), executor)?;
    let watcher_cancel = CancellationToken::new();
    let mut watcher_task = tokio::spawn({
        let cancel = watcher_cancel.clone();
        async move { watcher.run(cancel).await }
    });

    info!(target: "proxy", "press Ctrl+C to stop");

    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        joined = &mut watcher_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.context("watcher failed")),
            Err(e) => Err(anyhow!("watcher task panicked: {e}")),
        },
    };

    info!(target: "proxy", "shutting down");

    // Teardown order matters: stop producing builds before killing the
    // backend, then silence the monitor, then the listener.
    watcher_cancel.cancel();
    if !watcher_task.is_finished() {
        let _ = watcher_task.await;
    }
    supervisor.shutdown().await;
    monitor_cancel.cancel();
    server.abort();

    if config.debug {
        info!(
            target: "proxy",
            "debug mode: preserving build status directory {}",
            config.build_status_dir.display()
        );
    } else {
        info!(
            target: "proxy",
            "removing build status directory: {}",
            config.build_status_dir.display()
        );
        if let Err(e) = tokio::fs::remove_dir_all(&config.build_status_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(target: "proxy", "failed to remove build status directory: {e}");
            }
        }
    }

    info!(target: "proxy", "shutdown complete");
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(target: "proxy", "failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
