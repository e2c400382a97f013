//! Filesystem watching: subscribes to the directories the build rules care
//! about, filters and debounces events, and triggers rebuilds.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::builder::BuildExecutor;
use crate::config::{BuildRule, Config};
use crate::pattern;

const DEBOUNCE_DELAY: Duration = Duration::from_millis(100);

/// Translates raw filesystem events into debounced per-rule build
/// triggers.
pub struct FileWatcher {
    config: Arc<Config>,
    executor: BuildExecutor,
    root: PathBuf,
    debounce: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl FileWatcher {
    pub fn new(config: Arc<Config>, executor: BuildExecutor) -> Result<Self> {
        let root = std::env::current_dir().context("failed to resolve working directory")?;
        Ok(Self::with_root(config, executor, root))
    }

    fn with_root(config: Arc<Config>, executor: BuildExecutor, root: PathBuf) -> Self {
        Self {
            config,
            executor,
            root,
            debounce: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the watched directories and pumps events until the token
    /// is cancelled. Registration failures abort startup.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<notify::Result<notify::Event>>(256);
        let mut fs_watcher = notify::recommended_watcher(move |res| {
            let _ = tx.blocking_send(res);
        })
        .context("failed to create filesystem watcher")?;

        for dir in self.directories_to_watch() {
            let target = self.root.join(&dir);
            fs_watcher
                .watch(&target, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch directory {dir}"))?;
            info!(target: "watcher", "watching directory: {dir}");
        }
        info!(target: "watcher", "started watching files");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(target: "watcher", "stopping watcher");
                    self.cancel_pending_debounces().await;
                    self.executor.stop_all().await;
                    return Ok(());
                }
                event = rx.recv() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => warn!(target: "watcher", "watch error: {e}"),
                    None => return Err(anyhow!("watcher event channel closed")),
                }
            }
        }
    }

    /// The de-duplicated set of directories the rules' watch patterns
    /// require, relative to the root. Directories matching a rule's own
    /// ignore patterns are dropped.
    fn directories_to_watch(&self) -> BTreeSet<String> {
        let mut dirs = BTreeSet::new();
        for rule in &self.config.build_rules {
            for pat in &rule.watch {
                for dir in self.directories_for_pattern(pat) {
                    if !ignores_directory(rule, &dir) {
                        dirs.insert(dir);
                    }
                }
            }
        }
        dirs
    }

    fn directories_for_pattern(&self, pat: &str) -> Vec<String> {
        if pat.contains("**") {
            // The root plus every non-hidden subdirectory.
            let mut dirs = vec![".".to_string()];
            let walker = WalkDir::new(&self.root)
                .min_depth(1)
                .into_iter()
                .filter_entry(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| !name.starts_with('.'))
                });
            for entry in walker.flatten() {
                if entry.file_type().is_dir() {
                    if let Some(rel) = relative_slash_path(&self.root, entry.path()) {
                        dirs.push(rel);
                    }
                }
            }
            dirs
        } else {
            // Watch the directory component; an empty one is the root.
            match pat.rsplit_once('/') {
                Some((dir, _)) if !dir.is_empty() => vec![dir.to_string()],
                _ => vec![".".to_string()],
            }
        }
    }

    async fn handle_event(&self, event: notify::Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
        ) {
            return;
        }
        for path in &event.paths {
            self.handle_path(path).await;
        }
    }

    async fn handle_path(&self, path: &Path) {
        let Some(rel) = relative_slash_path(&self.root, path) else {
            return;
        };
        let basename = rel.rsplit('/').next().unwrap_or(&rel);

        // Editor temp files and hidden files.
        if basename.starts_with('.') || rel.ends_with('~') || rel.contains(".tmp") {
            return;
        }
        if self.ignored_by_any_rule(&rel) {
            return;
        }

        info!(target: "watcher", "file changed: {rel}");

        for rule in &self.config.build_rules {
            if rule.watch.iter().any(|pat| pattern::matches(&rel, pat)) {
                self.debounce(rule).await;
            }
        }
    }

    fn ignored_by_any_rule(&self, rel: &str) -> bool {
        self.config.build_rules.iter().any(|rule| {
            rule.ignore
                .iter()
                .any(|pat| pattern::matches(rel, pat))
        })
    }

    /// Reset-on-trigger single-shot timer per rule: each call replaces the
    /// pending timer, so a burst of events within the delay collapses to
    /// one build.
    async fn debounce(&self, rule: &BuildRule) {
        let mut timers = self.debounce.lock().await;
        if let Some(previous) = timers.remove(&rule.name) {
            previous.abort();
        }

        let executor = self.executor.clone();
        let rule = rule.clone();
        let name = rule.name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_DELAY).await;
            executor.trigger(&rule).await;
        });
        timers.insert(name, handle);
    }

    async fn cancel_pending_debounces(&self) {
        let mut timers = self.debounce.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

fn ignores_directory(rule: &BuildRule, dir: &str) -> bool {
    rule.ignore.iter().any(|pat| {
        pattern::matches(dir, pat) || pattern::matches(&format!("{dir}/"), pat)
    })
}

/// Forward-slash path of `path` relative to `root`; None for paths outside
/// the root that cannot be relativized.
fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_rules(status_dir: &Path, rules: Vec<BuildRule>) -> Arc<Config> {
        Arc::new(Config {
            proxy_port: 3000,
            backend_port: 8080,
            build_status_dir: status_dir.to_path_buf(),
            run_cmd: "./tmp/main".to_string(),
            build_rules: rules,
            debug: false,
        })
    }

    fn rule(name: &str, watch: &[&str], ignore: &[&str], command: &str) -> BuildRule {
        BuildRule {
            name: name.to_string(),
            watch: watch.iter().map(|s| s.to_string()).collect(),
            ignore: ignore.iter().map(|s| s.to_string()).collect(),
            command: command.to_string(),
        }
    }

    fn watcher_for(root: &Path, rules: Vec<BuildRule>) -> (FileWatcher, tempfile::TempDir) {
        let status = tempfile::tempdir().expect("tempdir");
        let config = config_with_rules(&status.path().join("status"), rules);
        let (tx, _rx) = mpsc::channel(4);
        let executor = BuildExecutor::new(Arc::clone(&config), tx);
        (
            FileWatcher::with_root(config, executor, root.to_path_buf()),
            status,
        )
    }

    #[tokio::test]
    async fn recursive_pattern_walks_non_hidden_subdirectories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/api")).expect("mkdir");
        std::fs::create_dir_all(root.join(".git/objects")).expect("mkdir");
        std::fs::create_dir_all(root.join(".cache")).expect("mkdir");
        std::fs::create_dir_all(root.join("vendor/dep")).expect("mkdir");

        let (watcher, _status) = watcher_for(
            root,
            vec![rule("go-build", &["**/*.go"], &["vendor/**"], "true")],
        );

        let dirs = watcher.directories_to_watch();
        assert!(dirs.contains("."));
        assert!(dirs.contains("src"));
        assert!(dirs.contains("src/api"));
        assert!(!dirs.iter().any(|d| d.starts_with(".git")));
        assert!(!dirs.iter().any(|d| d.starts_with(".cache")));
        // Ignored directories are not subscribed.
        assert!(!dirs.iter().any(|d| d.starts_with("vendor")));
    }

    #[tokio::test]
    async fn simple_pattern_watches_its_directory_component() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (watcher, _status) = watcher_for(
            dir.path(),
            vec![
                rule("css", &["web/*.css"], &[], "true"),
                rule("root", &["*.go"], &[], "true"),
            ],
        );

        let dirs = watcher.directories_to_watch();
        assert_eq!(
            dirs.into_iter().collect::<Vec<_>>(),
            vec![".".to_string(), "web".to_string()]
        );
    }

    #[tokio::test]
    async fn debounce_collapses_a_burst_into_one_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let status_dir = dir.path().join("status");
        let r = rule("go-build", &["**/*.go"], &[], "true");
        let config = config_with_rules(&status_dir, vec![r.clone()]);
        let (tx, mut rx) = mpsc::channel(8);
        let executor = BuildExecutor::new(Arc::clone(&config), tx);
        let watcher = FileWatcher::with_root(config, executor, dir.path().to_path_buf());

        for _ in 0..5 {
            watcher.debounce(&r).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("one build completes")
            .expect("channel open");
        // Let any (wrongly) duplicated timers fire before checking.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());

        let mut building = 0;
        let mut entries = tokio::fs::read_dir(&status_dir).await.expect("read_dir");
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().ends_with("-building") {
                building += 1;
            }
        }
        assert_eq!(building, 1);
    }

    #[tokio::test]
    async fn paths_matching_watch_and_ignore_do_not_trigger() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (watcher, _status) = watcher_for(
            dir.path(),
            vec![rule(
                "go-build",
                &["**/*.go"],
                &["vendor/**", "**/*_test.go"],
                "true",
            )],
        );

        assert!(watcher.ignored_by_any_rule("vendor/x/y.go"));
        assert!(watcher.ignored_by_any_rule("api/handlers_test.go"));
        assert!(!watcher.ignored_by_any_rule("api/handlers.go"));
    }

    #[tokio::test]
    async fn hidden_and_temporary_files_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let (watcher, _status) = watcher_for(
            &root,
            vec![rule("go-build", &["**/*.go"], &[], "true")],
        );

        // None of these may leave a pending debounce timer behind.
        watcher.handle_path(&root.join(".main.go.swp")).await;
        watcher.handle_path(&root.join("main.go~")).await;
        watcher.handle_path(&root.join("main.go.tmp")).await;
        watcher.handle_path(&root.join("main.rs")).await;
        assert!(watcher.debounce.lock().await.is_empty());

        watcher.handle_path(&root.join("main.go")).await;
        assert_eq!(watcher.debounce.lock().await.len(), 1);
        watcher.cancel_pending_debounces().await;
    }
}
