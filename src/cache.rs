//! Chess manual: bounded position cache keyed by `Fingerprint`.
//! Lookups share a read lock and bump an atomic recency stamp; inserts and
//! evictions take the write lock, so there is never more than one entry per key.
//! Persisted as JSON at `chess_manual_path`. A broken file never stops the
//! program: the store starts empty, or with whichever entries still parse.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::board::Pos;
use crate::config::RuleMode;
use crate::error::AssistError;
use crate::fingerprint::Fingerprint;

const FILE_VERSION: u64 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChessManualEntry {
    pub fingerprint: Fingerprint,
    pub recommended: Pos,
    pub gtp: String,
    pub visits: u64,
    pub winrate: Option<f32>,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    entry: ChessManualEntry,
    last_access: AtomicU64,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    #[serde(flatten)]
    entry: ChessManualEntry,
    last_access: u64,
}

#[derive(Serialize)]
struct ManualFile<'a> {
    version: u64,
    board_size: usize,
    rule: RuleMode,
    entries: &'a [StoredEntry],
}

pub struct ChessManualStore {
    capacity: usize,
    path: PathBuf,
    board_size: usize,
    rule: RuleMode,
    slots: RwLock<HashMap<Fingerprint, Slot>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    unflushed: AtomicUsize,
}

impl ChessManualStore {
    pub fn new(capacity: usize, path: PathBuf, board_size: usize, rule: RuleMode) -> Self {
        Self {
            capacity: capacity.max(1),
            path,
            board_size,
            rule,
            slots: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            unflushed: AtomicUsize::new(0),
        }
    }

    /// Loads the store from `path`. Missing file: empty store. Unreadable or
    /// foreign file: logged as corrupt, empty store. Bad entries are skipped.
    pub fn load(capacity: usize, path: &Path, board_size: usize, rule: RuleMode) -> Self {
        let store = Self::new(capacity, path.to_path_buf(), board_size, rule);
        if !path.exists() {
            info!(path = %path.display(), "no chess manual yet, starting empty");
            return store;
        }
        match store.read_entries(path) {
            Ok((entries, skipped)) => {
                if skipped > 0 {
                    warn!(skipped, "skipped malformed chess manual entries");
                }
                store.restore(entries);
                info!(entries = store.len(), path = %path.display(), "loaded chess manual");
            }
            Err(e) => {
                warn!("{}; rebuilding from empty", e);
            }
        }
        store
    }

    fn read_entries(&self, path: &Path) -> Result<(Vec<StoredEntry>, usize), AssistError> {
        let text = fs::read_to_string(path)
            .map_err(|e| AssistError::CacheCorrupt(format!("{}: {}", path.display(), e)))?;
        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| AssistError::CacheCorrupt(format!("{}: {}", path.display(), e)))?;

        let version = doc.get("version").and_then(Value::as_u64);
        if version != Some(FILE_VERSION) {
            return Err(AssistError::CacheCorrupt(format!(
                "unsupported version {:?}",
                version
            )));
        }
        let size = doc.get("board_size").and_then(Value::as_u64);
        if size != Some(self.board_size as u64) {
            return Err(AssistError::CacheCorrupt(format!(
                "board size {:?} does not match {}",
                size, self.board_size
            )));
        }
        let rule = doc
            .get("rule")
            .cloned()
            .and_then(|v| serde_json::from_value::<RuleMode>(v).ok());
        if rule != Some(self.rule) {
            return Err(AssistError::CacheCorrupt(format!(
                "rule {:?} does not match {}",
                rule, self.rule
            )));
        }
        let raw = doc
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| AssistError::CacheCorrupt("missing entries".into()))?;

        let mut skipped = 0;
        let mut entries = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<StoredEntry>(value.clone()) {
                Ok(stored) if stored.entry.fingerprint.board_size() == Some(self.board_size) => {
                    entries.push(stored)
                }
                _ => skipped += 1,
            }
        }
        Ok((entries, skipped))
    }

    fn restore(&self, mut entries: Vec<StoredEntry>) {
        // Most recent first, so overflow drops the least recently used.
        entries.sort_by(|a, b| b.last_access.cmp(&a.last_access));
        let mut slots = self.slots.write();
        let mut newest = 0;
        for stored in entries {
            if slots.len() >= self.capacity {
                break;
            }
            if slots.contains_key(&stored.entry.fingerprint) {
                continue;
            }
            newest = newest.max(stored.last_access);
            slots.insert(
                stored.entry.fingerprint.clone(),
                Slot {
                    entry: stored.entry,
                    last_access: AtomicU64::new(stored.last_access),
                },
            );
        }
        self.clock.store(newest, Ordering::SeqCst);
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<ChessManualEntry> {
        let slots = self.slots.read();
        match slots.get(fingerprint) {
            Some(slot) => {
                slot.last_access.store(self.tick(), Ordering::SeqCst);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or overwrites; returns the evicted key when capacity overflowed.
    pub fn insert(&self, entry: ChessManualEntry) -> Option<Fingerprint> {
        let stamp = self.tick();
        let mut slots = self.slots.write();
        let mut evicted = None;
        if !slots.contains_key(&entry.fingerprint) && slots.len() >= self.capacity {
            let oldest = slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_access.load(Ordering::SeqCst))
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                slots.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %key, "evicted least recently used position");
                evicted = Some(key);
            }
        }
        slots.insert(
            entry.fingerprint.clone(),
            Slot {
                entry,
                last_access: AtomicU64::new(stamp),
            },
        );
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.unflushed.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.slots.read().contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Inserts since the last successful flush.
    pub fn unflushed(&self) -> usize {
        self.unflushed.load(Ordering::Relaxed)
    }

    /// Writes the store to a temporary sibling, then renames it over the target.
    pub fn flush(&self) -> Result<()> {
        let mut entries: Vec<StoredEntry> = {
            let slots = self.slots.read();
            slots
                .values()
                .map(|slot| StoredEntry {
                    entry: slot.entry.clone(),
                    last_access: slot.last_access.load(Ordering::SeqCst),
                })
                .collect()
        };
        entries.sort_by_key(|stored| stored.last_access);
        let file = ManualFile {
            version: FILE_VERSION,
            board_size: self.board_size,
            rule: self.rule,
            entries: &entries,
        };
        let text = serde_json::to_string(&file).context("Failed to serialize chess manual")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        self.unflushed.store(0, Ordering::Relaxed);
        debug!(entries = entries.len(), path = %self.path.display(), "flushed chess manual");
        Ok(())
    }
}
