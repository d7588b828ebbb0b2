//! Corpus directory watcher (spec §4.C).
//!
//! Surfaces newly-closed files under a watched directory, one batch per
//! poll, de-duplicated against a "seen" set that also backs peer-injection
//! bounce suppression (spec §4.H step 5). Tolerates the directory not
//! existing yet at startup by watching its parent for creation first.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::sleep;
use std::time::Duration;

use notify::{
    Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{AccessKind, AccessMode, RemoveKind},
};
use thiserror::Error;

/// Staging buffer cap per poll call (spec §4.C step 3: "at most 127 names").
const MAX_BATCH_NAMES: usize = 127;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watched corpus directory vanished")]
    DirectoryVanished,
    #[error("exceeded the {MAX_BATCH_NAMES}-name staging buffer in a single poll")]
    TooManyEvents,
    #[error("watcher channel disconnected")]
    Disconnected,
}

pub struct CorpusWatcher {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<notify::Event>>,
    seen: HashSet<PathBuf>,
}

impl CorpusWatcher {
    /// Sets up the watch, blocking (while honouring `cancelled`) until
    /// `dir_path` exists if it does not yet.
    pub fn new(dir_path: &Path, cancelled: &AtomicBool) -> Result<Self, std::io::Error> {
        wait_for_existence(dir_path, cancelled);

        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(tx, Config::default())
            .map_err(to_io_error)?;
        watcher
            .watch(dir_path, RecursiveMode::NonRecursive)
            .map_err(to_io_error)?;

        Ok(Self {
            dir: dir_path.to_path_buf(),
            _watcher: watcher,
            rx,
            seen: HashSet::new(),
        })
    }

    /// Drains currently-buffered events into a batch of newly-seen absolute
    /// paths. Returns an empty batch on a transient "would block".
    pub fn poll(&mut self) -> Result<Vec<PathBuf>, WatchError> {
        let mut batch = Vec::new();

        loop {
            let event = match self.rx.try_recv() {
                Ok(Ok(event)) => event,
                Ok(Err(err)) => {
                    log::warn!("corpus watcher error on {}: {err}", self.dir.display());
                    continue;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(WatchError::Disconnected),
            };

            if is_self_deleted(&event, &self.dir) {
                log::error!("corpus directory {} deleted", self.dir.display());
                return Err(WatchError::DirectoryVanished);
            }

            if !is_close_write(&event) {
                continue;
            }

            for path in &event.paths {
                let Some(name) = path.file_name() else {
                    log::warn!("corpus watcher event with empty name on {:?}", path);
                    continue;
                };
                if name.is_empty() {
                    log::warn!("corpus watcher event name length is zero");
                    continue;
                }

                if self.seen.contains(path) {
                    continue;
                }
                self.seen.insert(path.clone());

                if batch.len() >= MAX_BATCH_NAMES {
                    return Err(WatchError::TooManyEvents);
                }
                batch.push(path.clone());
            }
        }

        if !batch.is_empty() {
            log::debug!("got {} corpus events on {}", batch.len(), self.dir.display());
        }

        Ok(batch)
    }

    /// Marks `path` as already seen, so a later echo (e.g. the fuzzer
    /// re-emitting an injected input) does not get re-surfaced.
    pub fn mark_seen(&mut self, path: PathBuf) {
        self.seen.insert(path);
    }
}

fn is_close_write(event: &notify::Event) -> bool {
    matches!(
        event.kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

fn is_self_deleted(event: &notify::Event, dir: &Path) -> bool {
    matches!(event.kind, EventKind::Remove(RemoveKind::Any) | EventKind::Remove(RemoveKind::Folder))
        && event.paths.iter().any(|p| p == dir)
}

fn wait_for_existence(path: &Path, cancelled: &AtomicBool) {
    while !cancelled.load(Ordering::SeqCst) && !path.exists() {
        sleep(Duration::from_millis(50));
    }
}

fn to_io_error(err: notify::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn surfaces_closed_file_once_and_dedups_replay() {
        let dir = tempfile::tempdir().unwrap();
        let cancelled = AtomicBool::new(false);
        let mut watcher = CorpusWatcher::new(dir.path(), &cancelled).unwrap();

        let file_path = dir.path().join("seed-0001");
        std::fs::write(&file_path, b"hello").unwrap();

        // Give the OS a moment to deliver the close-write event.
        std::thread::sleep(Duration::from_millis(200));
        let batch = watcher.poll().unwrap();
        assert!(batch.contains(&file_path));

        // A later poll with no new events is empty, not an error.
        let batch2 = watcher.poll().unwrap();
        assert!(batch2.is_empty());
    }

    #[test]
    fn waits_for_directory_creation() {
        let base = tempfile::tempdir().unwrap();
        let corpus_dir = base.path().join("corpus");
        let cancelled = AtomicBool::new(false);

        let corpus_dir_clone = corpus_dir.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            std::fs::create_dir(&corpus_dir_clone).unwrap();
        });

        let watcher = CorpusWatcher::new(&corpus_dir, &cancelled);
        handle.join().unwrap();
        assert!(watcher.is_ok());
    }

    #[test]
    fn mark_seen_suppresses_future_surfacing() {
        let dir = tempfile::tempdir().unwrap();
        let cancelled = AtomicBool::new(false);
        let mut watcher = CorpusWatcher::new(dir.path(), &cancelled).unwrap();

        let file_path = dir.path().join("injected-0001");
        watcher.mark_seen(file_path.clone());
        std::fs::write(&file_path, b"hello").unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let batch = watcher.poll().unwrap();
        assert!(!batch.contains(&file_path));
    }
}
