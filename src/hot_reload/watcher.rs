use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};

/// Type of file change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed { from: PathBuf, to: PathBuf },
}

/// File change event
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: Instant,
}

/// File filter for specific extensions
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    extensions: Vec<String>,
}

impl FileFilter {
    /// Create new filter with extensions
    pub fn new(extensions: Vec<&str>) -> Self {
        Self {
            extensions: extensions.iter().map(|s| s.trim_start_matches('.').to_string()).collect(),
        }
    }

    /// Filter that lets every file through
    pub fn any() -> Self {
        Self::default()
    }

    /// Check if file passes filter
    pub fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        if let Some(ext) = path.extension() {
            if let Some(ext_str) = ext.to_str() {
                return self.extensions.iter().any(|e| e == ext_str);
            }
        }
        false
    }

    fn matches_event(&self, event: &ChangeEvent) -> bool {
        match &event.kind {
            ChangeKind::Renamed { from, to } => self.matches(from) || self.matches(to),
            _ => self.matches(&event.path),
        }
    }
}

/// Resumes delivery when dropped
#[must_use = "delivery resumes as soon as the guard is dropped"]
pub struct PauseGuard {
    paused: Arc<AtomicBool>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// Recursive watcher over one directory tree.
///
/// Every filesystem event that passes the filter is delivered once, in the
/// order the OS reports it. Events raised while delivery is paused are lost.
pub struct ChangeWatcher {
    root: PathBuf,
    filter: Arc<FileFilter>,
    paused: Arc<AtomicBool>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    tx: Sender<ChangeEvent>,
    rx: Receiver<ChangeEvent>,
}

impl ChangeWatcher {
    /// Create a stopped watcher. Fails if `root` is not a directory.
    pub fn new(root: impl AsRef<Path>, filter: FileFilter) -> EngineResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(EngineError::WatchError {
                path: root.display().to_string(),
                error: "directory does not exist".to_string(),
            });
        }
        let (tx, rx) = unbounded();
        Ok(Self {
            root,
            filter: Arc::new(filter),
            paused: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
            tx,
            rx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Begin delivering events. Starting a running watcher does nothing.
    pub fn start(&self) -> EngineResult<()> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }

        let tx = self.tx.clone();
        let filter = self.filter.clone();
        let paused = self.paused.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if paused.load(Ordering::SeqCst) {
                        log::trace!("Dropped change while paused: {:?}", event.paths);
                        return;
                    }
                    for change in convert(event) {
                        if filter.matches_event(&change) {
                            let _ = tx.send(change);
                        }
                    }
                }
                Err(e) => log::warn!("File watcher error: {}", e),
            })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        log::debug!("Watching {}", self.root.display());
        *slot = Some(watcher);
        Ok(())
    }

    /// Stop delivering events; pending events stay queued
    pub fn stop(&self) {
        if self.watcher.lock().take().is_some() {
            log::debug!("Stopped watching {}", self.root.display());
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Suspend delivery until the returned guard is dropped
    pub fn pause(&self) -> PauseGuard {
        self.paused.store(true, Ordering::SeqCst);
        PauseGuard {
            paused: self.paused.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Poll for events (non-blocking)
    pub fn try_events(&self) -> Vec<ChangeEvent> {
        self.rx.try_iter().collect()
    }

    /// Wait for next event up to `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ChangeEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Receiving end, for callers that block on several sources
    pub fn events(&self) -> Receiver<ChangeEvent> {
        self.rx.clone()
    }
}

fn convert(event: Event) -> Vec<ChangeEvent> {
    let now = Instant::now();
    let single = |kind: ChangeKind, paths: Vec<PathBuf>| {
        paths
            .into_iter()
            .map(|path| ChangeEvent {
                path,
                kind: kind.clone(),
                timestamp: now,
            })
            .collect::<Vec<_>>()
    };

    match event.kind {
        EventKind::Create(_) => single(ChangeKind::Created, event.paths),
        EventKind::Remove(_) => single(ChangeKind::Deleted, event.paths),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let from = event.paths[0].clone();
            let to = event.paths[1].clone();
            vec![ChangeEvent {
                path: to.clone(),
                kind: ChangeKind::Renamed { from, to },
                timestamp: now,
            }]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            single(ChangeKind::Deleted, event.paths)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            single(ChangeKind::Created, event.paths)
        }
        EventKind::Modify(_) => single(ChangeKind::Modified, event.paths),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_file_filter() {
        let filter = FileFilter::new(vec!["rs", ".sc"]);

        assert!(filter.matches(Path::new("src/lib.rs")));
        assert!(filter.matches(Path::new("shaders/fs_forward.sc")));
        assert!(!filter.matches(Path::new("test.txt")));
        assert!(!filter.matches(Path::new("no_extension")));
        assert!(FileFilter::any().matches(Path::new("anything")));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let missing = temp_dir.path().join("missing");
        assert!(matches!(
            ChangeWatcher::new(&missing, FileFilter::any()),
            Err(EngineError::WatchError { .. })
        ));
    }

    #[test]
    fn test_convert_rename() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("a.rs"))
            .add_path(PathBuf::from("b.rs"));
        let changes = convert(event);
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].kind,
            ChangeKind::Renamed {
                from: PathBuf::from("a.rs"),
                to: PathBuf::from("b.rs"),
            }
        );
    }

    #[test]
    fn test_watcher_delivers_filtered_events() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let watcher =
            ChangeWatcher::new(temp_dir.path(), FileFilter::new(vec!["rs"])).expect("watcher");
        watcher.start().expect("start");
        assert!(watcher.is_running());

        fs::write(temp_dir.path().join("notes.txt"), "ignored").expect("write txt");
        fs::write(temp_dir.path().join("lib.rs"), "fn main() {}").expect("write rs");

        let event = watcher
            .recv_timeout(Duration::from_secs(5))
            .expect("change event for lib.rs");
        assert_eq!(event.path.file_name().and_then(|n| n.to_str()), Some("lib.rs"));

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_watcher_restarts_after_stop() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let watcher =
            ChangeWatcher::new(temp_dir.path(), FileFilter::new(vec!["rs"])).expect("watcher");
        watcher.start().expect("start");
        watcher.stop();
        assert!(!watcher.is_running());

        watcher.start().expect("restart");
        assert!(watcher.is_running());
        fs::write(temp_dir.path().join("main.rs"), "fn main() {}").expect("write rs");

        let event = watcher
            .recv_timeout(Duration::from_secs(5))
            .expect("change event after restart");
        assert_eq!(event.path.file_name().and_then(|n| n.to_str()), Some("main.rs"));
        watcher.stop();
    }

    #[test]
    fn test_paused_watcher_drops_events() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let watcher = ChangeWatcher::new(temp_dir.path(), FileFilter::any()).expect("watcher");
        watcher.start().expect("start");

        {
            let _guard = watcher.pause();
            assert!(watcher.is_paused());
            fs::write(temp_dir.path().join("artifact.so"), "bytes").expect("write");
            std::thread::sleep(Duration::from_millis(300));
        }
        assert!(!watcher.is_paused());
        assert!(watcher.try_events().is_empty());
    }
}
