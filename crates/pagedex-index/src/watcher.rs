//! Page watcher for automatic re-indexing.
//!
//! Watches a directory of `<page_id>.json` files and feeds changes into a
//! [`PageIndex`]. Events are debounced per path so an editor writing a file
//! in several steps results in a single save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::service::PageIndex;

/// Extension of page files.
pub const PAGE_EXTENSION: &str = "json";

/// Errors that can occur in the page watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    CreateError(String),

    #[error("Failed to watch path: {0}")]
    WatchError(String),
}

/// Debounced change to a page file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
}

impl PageEvent {
    /// Path the event refers to.
    pub fn path(&self) -> &Path {
        match self {
            PageEvent::Created(p) | PageEvent::Modified(p) | PageEvent::Deleted(p) => p,
        }
    }

    /// Merge a newer event for the same path into this one.
    ///
    /// Priority: Deleted > Created > Modified.
    pub fn merge(&self, newer: &PageEvent) -> PageEvent {
        match (self, newer) {
            (_, PageEvent::Deleted(p)) | (PageEvent::Deleted(p), _) => PageEvent::Deleted(p.clone()),
            (PageEvent::Created(p), _) | (_, PageEvent::Created(p)) => PageEvent::Created(p.clone()),
            (PageEvent::Modified(_), PageEvent::Modified(p)) => PageEvent::Modified(p.clone()),
        }
    }
}

/// Configuration for the page watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period before a path's events are emitted
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

/// Pending event state for debouncing.
#[derive(Debug, Clone)]
struct PendingEvent {
    event: PageEvent,
    last_seen: Instant,
}

/// Watches a pages directory.
pub struct PageWatcher {
    config: WatcherConfig,
    root_path: PathBuf,
    // Dropping the notify watcher stops event delivery
    watcher: Option<RecommendedWatcher>,
}

impl PageWatcher {
    pub fn new(root_path: PathBuf, config: WatcherConfig) -> Self {
        Self {
            config,
            root_path,
            watcher: None,
        }
    }

    /// Whether the watcher is running.
    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching and return a channel of debounced events.
    pub fn start(&mut self) -> Result<mpsc::Receiver<PageEvent>, WatcherError> {
        let (raw_tx, raw_rx) = mpsc::channel::<PageEvent>(100);
        let (debounced_tx, debounced_rx) = mpsc::channel(100);
        let debounce = self.config.debounce;

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for page_event in convert_event(event) {
                        // Receiver gone means the watcher is shutting down
                        let _ = raw_tx.blocking_send(page_event);
                    }
                }
                Err(e) => error!("Watch error: {}", e),
            }
        })
        .map_err(|e| WatcherError::CreateError(e.to_string()))?;

        watcher
            .watch(&self.root_path, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchError(e.to_string()))?;
        self.watcher = Some(watcher);

        tokio::spawn(debounce_events(raw_rx, debounced_tx, debounce));

        info!("Started watching {:?} with {:?} debounce", self.root_path, debounce);
        Ok(debounced_rx)
    }

    /// Stop watching.
    pub fn stop(&mut self) {
        self.watcher = None;
        info!("Stopped watching {:?}", self.root_path);
    }

    /// Watch until the event stream ends, saving and removing pages as their
    /// files change.
    pub async fn run(mut self, index: Arc<PageIndex>) -> Result<(), WatcherError> {
        let mut rx = self.start()?;
        while let Some(event) = rx.recv().await {
            apply_event(&index, &event).await;
        }
        Ok(())
    }
}

/// Apply one debounced event to the index. Errors are logged, never fatal.
pub async fn apply_event(index: &PageIndex, event: &PageEvent) {
    let path = event.path();
    let Some(page_id) = page_id_for(path) else {
        return;
    };

    // Editors that save by replace emit delete + create; trust the disk.
    let exists = tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false);
    if matches!(event, PageEvent::Deleted(_)) && !exists {
        debug!("Page file deleted: {:?}", path);
        if let Err(e) = index.remove_page(&page_id).await {
            error!("Failed to remove page {}: {}", page_id, e);
        }
        return;
    }

    let snapshot = match tokio::fs::read_to_string(path).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Failed to read {:?}: {}", path, e);
            return;
        }
    };
    debug!("Page file changed: {:?}", path);
    if let Err(e) = index.save_page(&page_id, &snapshot).await {
        error!("Failed to save page {}: {}", page_id, e);
    }
}

/// Page id of a page file: its file stem, when the extension matches.
pub fn page_id_for(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(PAGE_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && !s.starts_with('.'))
        .map(str::to_string)
}

fn convert_event(event: Event) -> Vec<PageEvent> {
    event
        .paths
        .into_iter()
        .filter(|path| page_id_for(path).is_some())
        .filter_map(|path| match event.kind {
            notify::EventKind::Create(_) => Some(PageEvent::Created(path)),
            notify::EventKind::Modify(_) => Some(PageEvent::Modified(path)),
            notify::EventKind::Remove(_) => Some(PageEvent::Deleted(path)),
            _ => None,
        })
        .collect()
}

/// Hold events until their path has been quiet for `debounce`.
async fn debounce_events(
    mut raw_rx: mpsc::Receiver<PageEvent>,
    debounced_tx: mpsc::Sender<PageEvent>,
    debounce: Duration,
) {
    let mut pending: HashMap<PathBuf, PendingEvent> = HashMap::new();
    let tick = Duration::from_millis(50);

    loop {
        match tokio::time::timeout(tick, raw_rx.recv()).await {
            Ok(Some(event)) => {
                let now = Instant::now();
                pending
                    .entry(event.path().to_path_buf())
                    .and_modify(|p| {
                        p.event = p.event.merge(&event);
                        p.last_seen = now;
                    })
                    .or_insert(PendingEvent {
                        event,
                        last_seen: now,
                    });
            }
            Ok(None) => {
                for (_, p) in pending.drain() {
                    let _ = debounced_tx.send(p.event).await;
                }
                return;
            }
            Err(_) => {}
        }

        let now = Instant::now();
        let mut ready = Vec::new();
        pending.retain(|_, p| {
            if now.duration_since(p.last_seen) >= debounce {
                ready.push(p.event.clone());
                false
            } else {
                true
            }
        });

        for event in ready {
            if debounced_tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_page_id_for() {
        assert_eq!(page_id_for(Path::new("/pages/abc.json")), Some("abc".to_string()));
        assert_eq!(page_id_for(Path::new("/pages/abc.txt")), None);
        assert_eq!(page_id_for(Path::new("/pages/noext")), None);
        assert_eq!(page_id_for(Path::new("/pages/.json")), None);
    }

    #[test]
    fn test_merge_delete_wins() {
        let path = PathBuf::from("/pages/a.json");
        let created = PageEvent::Created(path.clone());
        let modified = PageEvent::Modified(path.clone());
        let deleted = PageEvent::Deleted(path.clone());

        assert_eq!(created.merge(&deleted), deleted);
        assert_eq!(modified.merge(&deleted), deleted);
        assert_eq!(deleted.merge(&created), deleted);
    }

    #[test]
    fn test_merge_create_beats_modify() {
        let path = PathBuf::from("/pages/a.json");
        let created = PageEvent::Created(path.clone());
        let modified = PageEvent::Modified(path.clone());

        assert_eq!(created.merge(&modified), created);
        assert_eq!(modified.merge(&created), created);
        assert_eq!(modified.merge(&modified), modified);
    }

    #[tokio::test]
    async fn test_debounce_collapses_bursts() {
        let (raw_tx, raw_rx) = mpsc::channel(10);
        let (tx, mut rx) = mpsc::channel(10);
        tokio::spawn(debounce_events(raw_rx, tx, Duration::from_millis(30)));

        let path = PathBuf::from("/pages/a.json");
        raw_tx.send(PageEvent::Created(path.clone())).await.unwrap();
        raw_tx.send(PageEvent::Modified(path.clone())).await.unwrap();
        raw_tx.send(PageEvent::Modified(path.clone())).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PageEvent::Created(path));

        drop(raw_tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_watcher_start_stop() {
        let dir = tempdir().unwrap();
        let mut watcher = PageWatcher::new(dir.path().to_path_buf(), WatcherConfig::default());

        let _rx = watcher.start().unwrap();
        assert!(watcher.is_running());

        watcher.stop();
        assert!(!watcher.is_running());
    }
}
