//! Positions — durable per-container resume timestamps.
//!
//! The store keeps the latest delivered timestamp for each container in
//! memory and persists it periodically as JSON:
//!
//! ```json
//! {"positions":{"<container id>":"2021-12-09T09:15:03.000000042Z"},"unstamped":{"<container id>":2}}
//! ```
//!
//! `unstamped` counts lines delivered after the stored timestamp whose own
//! timestamp did not parse. The daemon replays them on resume, so the
//! reader skips that many before forwarding again. Moving the timestamp
//! forward clears the count.
//!
//! Writes go to a temporary sibling file which is then renamed over the
//! target, so a crash never leaves a half-written file behind.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conf::PositionsConfig;

#[derive(Error, Debug)]
pub enum PositionsError {
    #[error("Positions file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Positions file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionsFile {
    #[serde(default)]
    positions: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    unstamped: BTreeMap<String, u64>,
}

pub struct Positions {
    path: PathBuf,
    entries: DashMap<String, DateTime<Utc>>,
    unstamped: DashMap<String, u64>,
    dirty: AtomicBool,
    /// Serializes concurrent flushes onto the same tmp file.
    flush_lock: parking_lot::Mutex<()>,
}

impl Positions {
    /// Open the store at `path`. A missing file is an empty store; a corrupt
    /// one is an error unless `ignore_invalid` is set.
    pub fn open(path: impl Into<PathBuf>, ignore_invalid: bool) -> Result<Self, PositionsError> {
        let path = path.into();
        let file = match read_file(&path) {
            Ok(file) => file,
            Err(PositionsError::Corrupt { source, .. }) if ignore_invalid => {
                warn!(path = %path.display(), error = %source, "Ignoring corrupt positions file");
                PositionsFile::default()
            }
            Err(e) => return Err(e),
        };
        let entries: DashMap<_, _> = file.positions.into_iter().collect();
        let unstamped = file.unstamped.into_iter().filter(|(_, n)| *n > 0).collect();

        info!(path = %path.display(), entries = entries.len(), "Positions loaded");
        Ok(Self {
            path,
            entries,
            unstamped,
            dirty: AtomicBool::new(false),
            flush_lock: parking_lot::Mutex::new(()),
        })
    }

    pub fn load(config: &PositionsConfig) -> Result<Self, PositionsError> {
        Self::open(&config.path, config.ignore_invalid)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, container_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(container_id).map(|e| *e.value())
    }

    /// Record `ts` for `container_id` if it is newer than what is stored.
    /// Returns whether the stored value changed.
    pub fn put(&self, container_id: &str, ts: DateTime<Utc>) -> bool {
        let changed = match self.entries.entry(container_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(ts);
                true
            }
            Entry::Occupied(mut slot) if *slot.get() < ts => {
                slot.insert(ts);
                true
            }
            Entry::Occupied(_) => false,
        };
        if changed {
            self.unstamped.remove(container_id);
            self.dirty.store(true, Ordering::Release);
        }
        changed
    }

    /// Lines without a parseable timestamp delivered after the stored one.
    pub fn unstamped(&self, container_id: &str) -> u64 {
        self.unstamped.get(container_id).map_or(0, |n| *n.value())
    }

    pub fn set_unstamped(&self, container_id: &str, count: u64) {
        let previous = if count == 0 {
            self.unstamped.remove(container_id).map(|(_, n)| n)
        } else {
            self.unstamped.insert(container_id.to_string(), count)
        };
        if previous.unwrap_or(0) != count {
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn remove(&self, container_id: &str) -> Option<DateTime<Utc>> {
        let removed = self.entries.remove(container_id).map(|(_, ts)| ts);
        let had_unstamped = self.unstamped.remove(container_id).is_some();
        if removed.is_some() || had_unstamped {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the store if anything changed since the last flush.
    /// Returns whether a write happened.
    pub fn flush(&self) -> Result<bool, PositionsError> {
        let _guard = self.flush_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let file = PositionsFile {
            positions: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            unstamped: self
                .unstamped
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        };
        if let Err(e) = write_file(&self.path, &file) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(path = %self.path.display(), entries = file.positions.len(), "Positions flushed");
        Ok(true)
    }

    /// Flush every `period` until `shutdown` fires, then flush one last time.
    pub async fn run_sync(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let store = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || store.flush()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(error = %e, "Positions sync failed"),
                        Err(e) => error!(error = %e, "Positions sync task panicked"),
                    }
                }
            }
        }

        if let Err(e) = self.flush() {
            error!(error = %e, "Final positions flush failed");
        }
        info!("Positions sync stopped");
    }
}

fn read_file(path: &Path) -> Result<PositionsFile, PositionsError> {
    let contents = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PositionsFile::default()),
        Err(source) => {
            return Err(PositionsError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if contents.iter().all(u8::is_ascii_whitespace) {
        return Ok(PositionsFile::default());
    }
    serde_json::from_slice(&contents).map_err(|source| PositionsError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, file: &PositionsFile) -> Result<(), PositionsError> {
    let io_err = |source| PositionsError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let body = serde_json::to_vec_pretty(file).map_err(|source| PositionsError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, body).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64, nanos: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, nanos).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Positions::open(dir.path().join("positions.json"), false).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.get("abc"), None);
    }

    #[test]
    fn test_put_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let store = Positions::open(dir.path().join("p.json"), false).unwrap();

        assert!(store.put("abc", ts(100, 5)));
        assert!(store.put("abc", ts(100, 6)));
        assert!(!store.put("abc", ts(99, 0)));
        assert_eq!(store.get("abc"), Some(ts(100, 6)));
    }

    #[test]
    fn test_flush_and_reload_keeps_nanoseconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("positions.json");

        let store = Positions::open(&path, false).unwrap();
        store.put("abc", ts(1_639_041_303, 42));
        store.put("def", ts(1_639_041_304, 0));
        assert!(store.flush().unwrap());
        assert!(!store.flush().unwrap());

        let reloaded = Positions::open(&path, false).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("abc"), Some(ts(1_639_041_303, 42)));
    }

    #[test]
    fn test_remove_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        let store = Positions::open(&path, false).unwrap();
        store.put("abc", ts(1, 0));
        store.flush().unwrap();

        assert_eq!(store.remove("abc"), Some(ts(1, 0)));
        assert!(store.flush().unwrap());
        assert!(Positions::open(&path, false).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            Positions::open(&path, false),
            Err(PositionsError::Corrupt { .. })
        ));
        assert!(Positions::open(&path, true).unwrap().is_empty());
    }

    #[test]
    fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        let store = Positions::open(&path, false).unwrap();
        store.put("abc", ts(1_639_041_303, 42));
        store.flush().unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["positions"]["abc"], "2021-12-09T09:15:03.000000042Z");
    }

    #[test]
    fn test_unstamped_count_persists_until_timestamp_moves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        let store = Positions::open(&path, false).unwrap();
        store.put("abc", ts(10, 0));
        store.set_unstamped("abc", 2);
        store.flush().unwrap();

        let reloaded = Positions::open(&path, false).unwrap();
        assert_eq!(reloaded.unstamped("abc"), 2);
        assert_eq!(reloaded.unstamped("def"), 0);

        assert!(!reloaded.put("abc", ts(10, 0)));
        assert_eq!(reloaded.unstamped("abc"), 2);
        assert!(reloaded.put("abc", ts(11, 0)));
        assert_eq!(reloaded.unstamped("abc"), 0);
        assert!(reloaded.flush().unwrap());

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(json.get("unstamped").is_none());
    }

    #[test]
    fn test_failed_flush_keeps_store_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let path = blocker.join("p.json");

        let store = Positions::open(&path, false).unwrap();
        store.put("abc", ts(1, 0));
        assert!(matches!(store.flush(), Err(PositionsError::Io { .. })));
        assert!(matches!(store.flush(), Err(PositionsError::Io { .. })));

        assert!(store.put("abc", ts(2, 0)));
        assert_eq!(store.get("abc"), Some(ts(2, 0)));

        std::fs::remove_file(&blocker).unwrap();
        assert!(store.flush().unwrap());
        assert_eq!(Positions::open(&path, false).unwrap().get("abc"), Some(ts(2, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sync_flushes_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        let store = Arc::new(Positions::open(&path, false).unwrap());
        store.put("abc", ts(7, 0));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&store).run_sync(Duration::from_secs(10), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(11)).await;
        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!task.is_finished());
        assert_eq!(Positions::open(&path, false).unwrap().get("abc"), Some(ts(7, 0)));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_sync_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        let store = Arc::new(Positions::open(&path, false).unwrap());
        store.put("abc", ts(5, 0));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&store).run_sync(Duration::from_secs(3600), shutdown.clone()));
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(Positions::open(&path, false).unwrap().get("abc"), Some(ts(5, 0)));
    }
}
