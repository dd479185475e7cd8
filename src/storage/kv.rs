use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::error::AppResult;
use super::Storage;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PersistenceSettings {
    /// Enable periodic snapshotting of the store to disk
    #[serde(default)]
    pub enabled: bool,
    /// Interval in milliseconds between snapshots
    #[serde(default = "PersistenceSettings::default_interval_ms")]
    pub interval_ms: u64,
}

impl PersistenceSettings {
    fn default_interval_ms() -> u64 { 5_000 }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self { enabled: false, interval_ms: Self::default_interval_ms() }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot { version: u32, created_ms: i64, entries: Vec<(String, Vec<u8>)> }

const SNAPSHOT_VERSION: u32 = 1;

struct Inner {
    dir: Option<PathBuf>,
    settings: PersistenceSettings,
    map: parking_lot::RwLock<BTreeMap<String, Vec<u8>>>,
    /// Set on every mutation, cleared by a successful snapshot
    dirty: AtomicBool,
}

/// Ordered in-memory KV store with optional bincode snapshots under a directory.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<Inner>,
}

impl KvStore {
    /// A purely in-memory store; nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: None,
                settings: PersistenceSettings::default(),
                map: parking_lot::RwLock::new(BTreeMap::new()),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Open a store rooted at `dir`, loading `snapshot.bin` if present and starting the
    /// snapshot loop when persistence is enabled.
    pub fn open(dir: impl AsRef<Path>, settings: PersistenceSettings) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let s = Self {
            inner: Arc::new(Inner {
                dir: Some(dir),
                settings,
                map: parking_lot::RwLock::new(BTreeMap::new()),
                dirty: AtomicBool::new(false),
            }),
        };
        s.load_snapshot()?;
        s.ensure_persistence_loop();
        Ok(s)
    }

    fn snapshot_path(&self) -> Option<PathBuf> { self.inner.dir.as_ref().map(|d| d.join("snapshot.bin")) }

    fn ensure_persistence_loop(&self) {
        if !self.inner.settings.enabled || self.inner.dir.is_none() { return; }
        let interval = Duration::from_millis(self.inner.settings.interval_ms.max(1));
        // The thread only holds a weak handle so dropping the last store ends it.
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(interval);
                let Some(inner) = weak.upgrade() else { break; };
                let this = KvStore { inner };
                if let Err(e) = this.flush() {
                    warn!(target: "appgroup::storage", error = %e, "snapshot failed");
                }
            }
        });
    }

    /// Write a snapshot if anything changed since the last one.
    pub fn flush(&self) -> AppResult<()> {
        if !self.inner.dirty.swap(false, Ordering::AcqRel) { return Ok(()); }
        if let Err(e) = self.save_snapshot() {
            self.inner.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn save_snapshot(&self) -> AppResult<()> {
        let Some(path) = self.snapshot_path() else { return Ok(()); };
        let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0);
        let entries: Vec<(String, Vec<u8>)> = self.inner.map.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let count = entries.len();
        let snap = Snapshot { version: SNAPSHOT_VERSION, created_ms: now_ms, entries };
        let bytes = bincode::serialize(&snap)?;
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(tmp, &path)?;
        debug!(target: "appgroup::storage", entries = count, "snapshot written");
        Ok(())
    }

    /// Replace the in-memory contents with the snapshot on disk, if one exists.
    pub fn load_snapshot(&self) -> AppResult<()> {
        let Some(path) = self.snapshot_path() else { return Ok(()); };
        if !path.exists() { return Ok(()); }
        let bytes = std::fs::read(&path)?;
        let snap: Snapshot = bincode::deserialize(&bytes)?;
        if snap.version != SNAPSHOT_VERSION {
            warn!(target: "appgroup::storage", version = snap.version, "ignoring snapshot with unknown version");
            return Ok(());
        }
        let mut w = self.inner.map.write();
        w.clear();
        w.extend(snap.entries);
        debug!(target: "appgroup::storage", entries = w.len(), "snapshot loaded");
        Ok(())
    }

    pub fn len(&self) -> usize { self.inner.map.read().len() }
    pub fn is_empty(&self) -> bool { self.inner.map.read().is_empty() }
    /// Return a snapshot of all keys in this store
    pub fn keys(&self) -> Vec<String> { self.inner.map.read().keys().cloned().collect() }

    fn mark_dirty(&self) { self.inner.dirty.store(true, Ordering::Release); }
}

impl Storage for KvStore {
    fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>> {
        Ok(self.inner.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> AppResult<()> {
        self.inner.map.write().insert(key.to_string(), value);
        self.mark_dirty();
        Ok(())
    }

    fn delete(&self, key: &str) -> AppResult<()> {
        if self.inner.map.write().remove(key).is_some() { self.mark_dirty(); }
        Ok(())
    }

    fn list(&self, prefix: &str) -> AppResult<Vec<String>> {
        let r = self.inner.map.read();
        let mut out: Vec<String> = Vec::new();
        for (k, _) in r.range(prefix.to_string()..) {
            let Some(rest) = k.strip_prefix(prefix) else { break; };
            if rest.is_empty() { continue; }
            let child = match rest.find('/') {
                Some(idx) => &rest[..=idx],
                None => rest,
            };
            // Keys are ordered, so a repeated child is always the previous one.
            if out.last().map(|l| l.as_str()) != Some(child) { out.push(child.to_string()); }
        }
        Ok(out)
    }
}
