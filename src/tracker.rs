//! On-disk audit of build lifecycle events.
//!
//! The status directory holds two pointer files and one marker file per
//! lifecycle event:
//!
//! - `current-build-id` — the most recently started build, overwritten on
//!   every start.
//! - `last-success-build-id` — the most recently successful build.
//! - `<ts>-<build_id>-building` — created when the build starts.
//! - `<ts>-<build_id>-{success,failed,aborted}` — created when the build
//!   reaches that terminal state; `<ts>` is the event time, not the start
//!   time.
//!
//! Markers are never deleted during a session. Callers create one tracker
//! per build; the tracker itself does not synchronize concurrent use.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::debug;

pub const CURRENT_BUILD_ID_FILE: &str = "current-build-id";
pub const LAST_SUCCESS_BUILD_ID_FILE: &str = "last-success-build-id";

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn new_build_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Audit handle for a single build.
pub struct BuildTracker {
    status_dir: PathBuf,
    build_id: String,
}

impl BuildTracker {
    /// Ensures the status directory exists, allocates a build id, points
    /// `current-build-id` at it, and drops the building marker.
    pub async fn start(status_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(status_dir)
            .await
            .with_context(|| {
                format!("failed to create status directory {}", status_dir.display())
            })?;

        let build_id = new_build_id();
        let started_at = unix_now();
        debug!(target: "build", "build {build_id} starting (ts {started_at})");

        tokio::fs::write(status_dir.join(CURRENT_BUILD_ID_FILE), &build_id)
            .await
            .context("failed to write current-build-id")?;
        tokio::fs::write(
            status_dir.join(format!("{started_at}-{build_id}-building")),
            b"",
        )
        .await
        .context("failed to write building marker")?;

        Ok(Self {
            status_dir: status_dir.to_path_buf(),
            build_id,
        })
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    async fn write_marker(&self, state: &str) -> Result<()> {
        let ts = unix_now();
        let path = self.status_dir.join(format!("{ts}-{}-{state}", self.build_id));
        tokio::fs::write(&path, b"")
            .await
            .with_context(|| format!("failed to write {state} marker"))?;
        debug!(target: "build", "build {} marked {state} (ts {ts})", self.build_id);
        Ok(())
    }

    /// Success marker plus the `last-success-build-id` pointer. The
    /// building marker is retained for the audit trail.
    pub async fn complete(&self) -> Result<()> {
        self.write_marker("success").await?;
        tokio::fs::write(
            self.status_dir.join(LAST_SUCCESS_BUILD_ID_FILE),
            &self.build_id,
        )
        .await
        .context("failed to write last-success-build-id")?;
        Ok(())
    }

    pub async fn fail(&self) -> Result<()> {
        self.write_marker("failed").await
    }

    pub async fn abort(&self) -> Result<()> {
        self.write_marker("aborted").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn file_names(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.expect("read_dir");
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn start_creates_pointer_and_building_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let status_dir = dir.path().join("status");

        let tracker = BuildTracker::start(&status_dir).await.expect("start");

        let id = tracker.build_id().to_string();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let current = tokio::fs::read_to_string(status_dir.join(CURRENT_BUILD_ID_FILE))
            .await
            .expect("current-build-id");
        assert_eq!(current, id);

        let names = file_names(&status_dir).await;
        assert!(names.iter().any(|n| n.ends_with(&format!("{id}-building"))));
    }

    #[tokio::test]
    async fn complete_writes_success_marker_and_pointer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let status_dir = dir.path().to_path_buf();

        let tracker = BuildTracker::start(&status_dir).await.expect("start");
        tracker.complete().await.expect("complete");

        let id = tracker.build_id();
        let names = file_names(&status_dir).await;
        assert!(names.iter().any(|n| n.ends_with(&format!("{id}-building"))));
        assert!(names.iter().any(|n| n.ends_with(&format!("{id}-success"))));

        let last = tokio::fs::read_to_string(status_dir.join(LAST_SUCCESS_BUILD_ID_FILE))
            .await
            .expect("last-success-build-id");
        assert_eq!(last, id);
    }

    #[tokio::test]
    async fn fail_and_abort_leave_terminal_markers_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let status_dir = dir.path().to_path_buf();

        let failed = BuildTracker::start(&status_dir).await.expect("start");
        failed.fail().await.expect("fail");

        let aborted = BuildTracker::start(&status_dir).await.expect("start");
        aborted.abort().await.expect("abort");

        let names = file_names(&status_dir).await;
        assert!(names
            .iter()
            .any(|n| n.ends_with(&format!("{}-failed", failed.build_id()))));
        assert!(names
            .iter()
            .any(|n| n.ends_with(&format!("{}-aborted", aborted.build_id()))));
        assert!(!status_dir.join(LAST_SUCCESS_BUILD_ID_FILE).exists());
    }

    #[tokio::test]
    async fn current_build_id_tracks_the_latest_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let status_dir = dir.path().to_path_buf();

        let first = BuildTracker::start(&status_dir).await.expect("start");
        let second = BuildTracker::start(&status_dir).await.expect("start");
        assert_ne!(first.build_id(), second.build_id());

        let current = tokio::fs::read_to_string(status_dir.join(CURRENT_BUILD_ID_FILE))
            .await
            .expect("current-build-id");
        assert_eq!(current, second.build_id());
    }
}
