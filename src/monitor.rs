//! Backend liveness: a periodic TCP probe that drives proxy switching and
//! browser reloads.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::reload::ReloadBus;

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Down,
    Up,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Down => write!(f, "DOWN"),
            Self::Up => write!(f, "UP"),
        }
    }
}

type StatusCallback = Box<dyn Fn(BackendStatus) + Send + Sync>;

/// Probes `127.0.0.1:<backend_port>` once a second with a 500 ms dial
/// timeout. A `down → up` transition publishes a reload; every transition
/// invokes the status-change callback, if one is set.
pub struct LivenessMonitor {
    backend_addr: String,
    status: RwLock<BackendStatus>,
    on_status_change: RwLock<Option<StatusCallback>>,
    bus: ReloadBus,
}

impl LivenessMonitor {
    pub fn new(backend_port: u16, bus: ReloadBus) -> Self {
        Self {
            backend_addr: format!("127.0.0.1:{backend_port}"),
            status: RwLock::new(BackendStatus::Down),
            on_status_change: RwLock::new(None),
            bus,
        }
    }

    /// Current status; non-blocking read.
    pub fn status(&self) -> BackendStatus {
        *self.status.read()
    }

    pub fn set_status_change_callback(
        &self,
        callback: impl Fn(BackendStatus) + Send + Sync + 'static,
    ) {
        *self.on_status_change.write() = Some(Box::new(callback));
    }

    /// Publishes a reload regardless of the current status.
    pub fn force_reload(&self) {
        self.bus.broadcast();
    }

    /// Runs the probe loop until the token is cancelled. The first probe
    /// fires immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(PROBE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.check().await,
            }
        }
    }

    async fn check(&self) {
        let up = matches!(
            timeout(PROBE_TIMEOUT, TcpStream::connect(&self.backend_addr)).await,
            Ok(Ok(_))
        );
        self.update(if up {
            BackendStatus::Up
        } else {
            BackendStatus::Down
        });
    }

    fn update(&self, new_status: BackendStatus) {
        let old_status = {
            let mut status = self.status.write();
            std::mem::replace(&mut *status, new_status)
        };
        if old_status == new_status {
            return;
        }

        info!(target: "proxy", "backend status changed: {old_status} -> {new_status}");

        if let Some(callback) = self.on_status_change.read().as_ref() {
            callback(new_status);
        }

        if old_status == BackendStatus::Down && new_status == BackendStatus::Up {
            self.bus.broadcast();
        }
    }

    #[cfg(test)]
    pub(crate) fn set_status_for_test(&self, status: BackendStatus) {
        *self.status.write() = status;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn probe_tracks_a_real_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let bus = ReloadBus::new();
        let mut sub = bus.subscribe();
        let monitor = LivenessMonitor::new(port, bus);
        assert_eq!(monitor.status(), BackendStatus::Down);

        monitor.check().await;
        assert_eq!(monitor.status(), BackendStatus::Up);

        // The down → up transition published exactly one reload.
        assert_eq!(sub.recv().await, Some(()));

        drop(listener);
        monitor.check().await;
        assert_eq!(monitor.status(), BackendStatus::Down);
    }

    #[tokio::test]
    async fn callback_fires_on_every_transition() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let monitor = LivenessMonitor::new(port, ReloadBus::new());
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&transitions);
        monitor.set_status_change_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.check().await; // down -> up
        monitor.check().await; // up -> up, no transition
        drop(listener);
        monitor.check().await; // up -> down
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_reload_ignores_status() {
        let bus = ReloadBus::new();
        let mut sub = bus.subscribe();
        let monitor = LivenessMonitor::new(1, bus);

        assert_eq!(monitor.status(), BackendStatus::Down);
        monitor.force_reload();
        assert_eq!(sub.recv().await, Some(()));
    }
}
