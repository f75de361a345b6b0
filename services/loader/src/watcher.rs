//! Directory watcher feeding file creation events into the dispatcher queue.

use crate::dispatcher::FileEvent;
use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Watches one directory, non-recursively, for the lifetime of this value.
pub struct DirectoryWatcher {
    directory: PathBuf,
    _watcher: RecommendedWatcher,
}

impl DirectoryWatcher {
    /// Start watching `directory`, pushing creation events onto `tx`.
    ///
    /// A full queue blocks the notify thread rather than dropping events.
    pub fn start(directory: &Path, tx: mpsc::Sender<FileEvent>) -> Result<Self, notify::Error> {
        let (watcher, _) = Self::watch(directory, tx, StartupScan::default())?;
        Ok(watcher)
    }

    /// Start watching, then list the regular files already in `directory`.
    ///
    /// The returned backlog is in name order and never repeats a file the
    /// watcher forwards itself, so a file created while the listing runs is
    /// dispatched once.
    pub fn start_with_existing(
        directory: &Path,
        tx: mpsc::Sender<FileEvent>,
    ) -> Result<(Self, Vec<FileEvent>), notify::Error> {
        let (watcher, scan) = Self::watch(directory, tx, StartupScan::scanning())?;

        let listed = list_files(directory).map_err(notify::Error::io)?;
        let backlog = lock(&scan).finish(listed);

        info!(files = backlog.len(), "Found files already present");

        Ok((watcher, backlog.into_iter().map(FileEvent::file).collect()))
    }

    fn watch(
        directory: &Path,
        tx: mpsc::Sender<FileEvent>,
        scan: StartupScan,
    ) -> Result<(Self, Arc<Mutex<StartupScan>>), notify::Error> {
        let scan = Arc::new(Mutex::new(scan));
        let filter = Arc::clone(&scan);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_departure(&event.kind) {
                    let mut filter = lock(&filter);
                    event.paths.iter().for_each(|path| filter.forget(path));
                    return;
                }

                let admitted: Vec<FileEvent> = {
                    let mut filter = lock(&filter);
                    creation_events(&event)
                        .into_iter()
                        .filter(|e| e.is_dir || filter.admit_created(&e.path))
                        .collect()
                };

                for file_event in admitted {
                    if tx.blocking_send(file_event).is_err() {
                        debug!("Notification queue closed, dropping event");
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        })?;

        watcher.watch(directory, RecursiveMode::NonRecursive)?;

        info!(directory = %directory.display(), "Started monitoring directory");

        let watcher = Self {
            directory: directory.to_path_buf(),
            _watcher: watcher,
        };
        Ok((watcher, scan))
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        info!(directory = %self.directory.display(), "Stopped monitoring directory");
    }
}

/// Reconciles the startup listing with events the watcher delivers around it.
///
/// While the listing is pending, forwarded paths are remembered so the listing
/// skips them. Once it completes, listed paths are remembered so the watcher
/// skips a late creation event for them. A listed path is forgotten when its
/// file is removed or renamed away, so a later file of the same name is seen.
#[derive(Debug, Default)]
pub struct StartupScan {
    pending: bool,
    notified: HashSet<PathBuf>,
    listed: HashSet<PathBuf>,
}

impl StartupScan {
    /// A scan whose listing has not run yet
    pub fn scanning() -> Self {
        Self {
            pending: true,
            ..Self::default()
        }
    }

    /// Whether a creation event for `path` should be forwarded.
    pub fn admit_created(&mut self, path: &Path) -> bool {
        if self.listed.remove(path) {
            debug!(path = %path.display(), "Already queued by startup scan");
            return false;
        }
        if self.pending {
            self.notified.insert(path.to_path_buf());
        }
        true
    }

    pub fn forget(&mut self, path: &Path) {
        self.listed.remove(path);
    }

    /// Record the listing and return the paths still to dispatch, in order.
    pub fn finish(&mut self, listed: Vec<PathBuf>) -> Vec<PathBuf> {
        let backlog: Vec<PathBuf> = listed
            .into_iter()
            .filter(|path| !self.notified.contains(path))
            .collect();

        self.listed.extend(backlog.iter().cloned());
        self.notified.clear();
        self.pending = false;
        backlog
    }
}

fn lock(scan: &Mutex<StartupScan>) -> MutexGuard<'_, StartupScan> {
    scan.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_departure(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

/// Translate a notify event into creation events; anything else yields nothing.
pub fn creation_events(event: &Event) -> Vec<FileEvent> {
    let known_dir = match event.kind {
        EventKind::Create(CreateKind::File) => Some(false),
        EventKind::Create(CreateKind::Folder) => Some(true),
        // Backends that cannot tell report Any/Other; ask the filesystem
        EventKind::Create(_) => None,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .map(|path| FileEvent {
            path: path.clone(),
            is_dir: known_dir.unwrap_or_else(|| path.is_dir()),
        })
        .collect()
}

/// Regular files in `directory`, sorted by name.
fn list_files(directory: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}
