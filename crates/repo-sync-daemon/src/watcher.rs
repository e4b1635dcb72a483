//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini for change detection. Every regular file is
//! reported except hidden paths and the `.sync` state directory. Events on a
//! directory are expanded to the files inside it, so moving or deleting a
//! folder reports each file it carried.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce window used by `FileWatcher::new`.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// File event from the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path relative to vault root, `/`-separated
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// File watcher that monitors the vault directory.
pub struct FileWatcher {
    vault_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Last seen mtime per vault-relative path. Drops events that did not change
/// the file, and remembers which files lived under a directory that vanished.
type MtimeCache = Arc<Mutex<HashMap<String, SystemTime>>>;

impl FileWatcher {
    pub fn new(vault_path: PathBuf) -> Result<Self> {
        Self::with_debounce(vault_path, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(vault_path: PathBuf, debounce: Duration) -> Result<Self> {
        // FSEvents on macOS needs the real path (/var -> /private/var)
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let vault_path_clone = vault_path.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));
        seed_cache(&vault_path, &mtime_cache);

        let mut debouncer = new_debouncer(
            debounce,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        for file_event in
                            process_path(&event.path, &vault_path_clone, &mtime_cache)
                        {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}

/// Turn one debounced path into file events.
///
/// A file yields `Modified` unless its mtime is unchanged. A directory yields
/// `Modified` for every file under it. A path that no longer exists yields
/// `Deleted` for itself or, if it was a directory, for every known file under
/// it. Events come out in path order.
fn process_path(path: &Path, vault_path: &Path, mtime_cache: &MtimeCache) -> Vec<FileEvent> {
    let Some(relative) = syncable_path(path, vault_path) else {
        return Vec::new();
    };
    let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
    let mut events = Vec::new();

    if path.is_dir() {
        let mut files = Vec::new();
        files_under(path, vault_path, &mut files);
        for file in files {
            if let Some(file_relative) = syncable_path(&file, vault_path) {
                events.extend(modified(&mut cache, &file, file_relative));
            }
        }
    } else if path.exists() {
        events.extend(modified(&mut cache, path, relative));
    } else {
        let prefix = format!("{}/", relative);
        let mut gone: Vec<String> = cache
            .keys()
            .filter(|key| **key == relative || key.starts_with(&prefix))
            .cloned()
            .collect();
        if gone.is_empty() {
            gone.push(relative);
        }
        for key in gone {
            cache.remove(&key);
            events.push(FileEvent {
                path: key,
                kind: FileEventKind::Deleted,
            });
        }
    }

    events.sort_by(|a, b| a.path.cmp(&b.path));
    for event in &events {
        debug!("File event: {:?} - {}", event.kind, event.path);
    }
    events
}

fn modified(
    cache: &mut HashMap<String, SystemTime>,
    path: &Path,
    relative: String,
) -> Option<FileEvent> {
    if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
        if cache.get(&relative) == Some(&mtime) {
            return None;
        }
        cache.insert(relative.clone(), mtime);
    }
    Some(FileEvent {
        path: relative,
        kind: FileEventKind::Modified,
    })
}

/// Record the mtime of every file already in the vault.
fn seed_cache(vault_path: &Path, mtime_cache: &MtimeCache) {
    let mut files = Vec::new();
    files_under(vault_path, vault_path, &mut files);

    let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
    for file in files {
        let Some(relative) = syncable_path(&file, vault_path) else {
            continue;
        };
        if let Ok(mtime) = std::fs::metadata(&file).and_then(|m| m.modified()) {
            cache.insert(relative, mtime);
        }
    }
    debug!("Watching {} existing files", cache.len());
}

/// Syncable regular files under `dir`. Symlinked directories are not followed.
fn files_under(dir: &Path, vault_path: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if syncable_path(&path, vault_path).is_none() {
            continue;
        }
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => files_under(&path, vault_path, files),
            Ok(kind) if kind.is_file() => files.push(path),
            _ => {}
        }
    }
}

/// Vault-relative `/`-separated path, or `None` if the file should not sync.
///
/// Hidden components (which covers `.sync` and `.git`) are skipped.
pub fn syncable_path(path: &Path, vault_path: &Path) -> Option<String> {
    let relative = path.strip_prefix(vault_path).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str()?;
                if part.starts_with('.') {
                    return None;
                }
                parts.push(part);
            }
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
