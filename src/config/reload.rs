//! Configuration change detection.

use super::RelayConfig;
use crate::{Error, Result};
use notify::event::EventKind;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Reloads the configuration file after it changes on disk.
///
/// A `notify` watcher on the file's directory raises a flag; the main loop
/// drains it with [`poll`](Self::poll) between cycles, so a burst of editor
/// events causes one reload. An edited but invalid file is reported and
/// otherwise ignored, so the last good configuration stays in effect.
pub struct ConfigWatcher {
    path: PathBuf,
    changed: Arc<AtomicBool>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Starts watching `path`, treating its current contents as already loaded.
    ///
    /// The parent directory is watched so editors that replace the file by
    /// rename are still noticed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the watcher cannot be created or
    /// the directory cannot be watched.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| Error::InvalidInput(format!("{} is not a file path", path.display())))?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let changed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&changed);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        debug!(kind = ?event.kind, "Configuration file event");
                        flag.store(true, Ordering::Release);
                    }
                },
                Err(e) => warn!(error = %e, "Configuration watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::operation("create_config_watcher", e))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::operation("watch_config_dir", format!("{}: {e}", dir.display())))?;

        Ok(Self {
            path,
            changed,
            _watcher: watcher,
        })
    }

    /// The watched path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if the file changed since the last [`poll`](Self::poll).
    #[must_use]
    pub fn has_pending_change(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Returns a freshly loaded configuration if the file changed and is valid.
    pub fn poll(&mut self) -> Option<RelayConfig> {
        if !self.changed.swap(false, Ordering::AcqRel) {
            return None;
        }

        match RelayConfig::load(&self.path) {
            Ok(config) => {
                info!(path = %self.path.display(), feeds = config.feeds.len(), "Configuration reloaded");
                Some(config)
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Configuration reload failed, keeping previous configuration");
                None
            },
        }
    }
}

impl fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("path", &self.path)
            .field("changed", &self.has_pending_change())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const VALID: &str = "telegram:\n  bot_token: \"1:a\"\n  check_interval: 5\nfeeds:\n  - name: a\n    url: https://a.test/feed\n    channels: [\"@a\"]\n";

    fn wait_for_change(watcher: &ConfigWatcher) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if watcher.has_pending_change() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_unchanged_file_is_not_reloaded() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, VALID).expect("write");

        let mut watcher = ConfigWatcher::new(&path).expect("watch");
        assert!(!watcher.has_pending_change());
        assert!(watcher.poll().is_none());
    }

    #[test]
    fn test_edit_on_disk_is_detected_and_reloaded() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, VALID).expect("write");
        let mut watcher = ConfigWatcher::new(&path).expect("watch");

        fs::write(&path, VALID.replace("check_interval: 5", "check_interval: 7")).expect("write");

        assert!(wait_for_change(&watcher), "no change event within 5s");
        let config = watcher.poll().expect("reloaded");
        assert_eq!(config.telegram.check_interval, 7);
    }

    #[test]
    fn test_pending_change_is_drained_once() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, VALID).expect("write");
        let mut watcher = ConfigWatcher::new(&path).expect("watch");

        watcher.changed.store(true, Ordering::Release);
        assert!(watcher.poll().is_some());
        assert!(!watcher.has_pending_change());
        assert!(watcher.poll().is_none());
    }

    #[test]
    fn test_invalid_edit_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, VALID).expect("write");
        let mut watcher = ConfigWatcher::new(&path).expect("watch");

        fs::write(&path, "telegram: [not, a, map]").expect("write");
        watcher.changed.store(true, Ordering::Release);

        assert!(watcher.poll().is_none());
        assert_eq!(watcher.path(), path.as_path());
    }

    #[test]
    fn test_other_files_in_directory_are_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, VALID).expect("write");
        let watcher = ConfigWatcher::new(&path).expect("watch");

        fs::write(dir.path().join("notes.txt"), "unrelated").expect("write");
        std::thread::sleep(Duration::from_millis(300));

        assert!(!watcher.has_pending_change());
    }
}
