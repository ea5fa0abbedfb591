//! On-disk archive cache keyed by request fingerprint
//!
//! Published archives live in the store directory as
//! `<fingerprint>.<extension>`. The in-memory index is sharded (`DashMap`),
//! and every file operation on a canonical path happens while holding that
//! fingerprint's entry, so publish and eviction of the same fingerprint are
//! serialized while unrelated fingerprints proceed in parallel.

use crate::{Config, Fingerprint, Metrics, PackagerError};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STAGING_SUFFIX: &str = ".partial";

/// Source of the current time for cache age arithmetic
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A published archive.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub archive_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

impl CacheEntry {
    /// File name clients use to build the download URL.
    pub fn file_name(&self) -> String {
        self.archive_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub struct CacheStore {
    root: PathBuf,
    extension: String,
    cache_time: chrono::Duration,
    entries: DashMap<Fingerprint, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// Open the store directory, indexing archives left by a previous run.
    pub fn open(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, PackagerError> {
        let root = config.store_directory.clone();
        std::fs::create_dir_all(&root).map_err(|e| {
            PackagerError::StorageFailure(format!(
                "failed to create store directory {}: {e}",
                root.display()
            ))
        })?;

        // Clamped to a century so the conversion cannot overflow.
        let cache_secs = config.cache_time().as_secs().min(100 * 365 * 24 * 3600) as i64;

        let store = Self {
            root,
            extension: config.archive_extension.clone(),
            cache_time: chrono::Duration::seconds(cache_secs),
            entries: DashMap::new(),
            clock,
        };

        store.index_existing()?;
        Ok(store)
    }

    fn index_existing(&self) -> Result<(), PackagerError> {
        let mut indexed = 0usize;

        for dir_entry in std::fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.starts_with('.') && name.ends_with(STAGING_SUFFIX) {
                debug!("Removing abandoned staging file {}", path.display());
                let _ = std::fs::remove_file(&path);
                continue;
            }

            let Some(stem) = name.strip_suffix(&format!(".{}", self.extension)) else {
                continue;
            };
            let Some(fingerprint) = Fingerprint::parse(stem) else {
                continue;
            };

            let metadata = std::fs::metadata(&path)?;
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| self.clock.now());

            self.entries.insert(
                fingerprint.clone(),
                CacheEntry {
                    fingerprint,
                    archive_path: path,
                    created_at,
                    size: metadata.len(),
                },
            );
            indexed += 1;
        }

        info!("Cache store at {} opened with {} archives", self.root.display(), indexed);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn canonical_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.archive_file_name(&self.extension))
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.created_at > self.cache_time
    }

    /// Return the live entry for `fingerprint`, if any.
    ///
    /// Expired entries, and entries whose file has disappeared, count as a
    /// miss and are dropped on the spot.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let now = self.clock.now();
        let entry = self.entries.get(fingerprint)?.clone();

        if self.is_expired(&entry, now) {
            self.evict_if_expired(fingerprint, now);
            return None;
        }

        if !entry.archive_path.exists() {
            warn!(
                "Archive {} vanished from the store, dropping cache entry",
                entry.archive_path.display()
            );
            self.entries
                .remove_if(fingerprint, |_, current| current.created_at == entry.created_at);
            return None;
        }

        Some(entry)
    }

    /// Move a finished archive into the store under its canonical name.
    ///
    /// The archive is first placed at a hidden staging name inside the store
    /// directory and flushed, then renamed over the canonical path, so a
    /// reader opening the canonical path only ever sees a complete file.
    /// An existing entry for the same fingerprint is replaced.
    pub async fn publish(
        &self,
        fingerprint: &Fingerprint,
        temp_path: &Path,
    ) -> Result<CacheEntry, PackagerError> {
        let staging = self.root.join(format!(
            ".{}.{}{}",
            fingerprint,
            uuid::Uuid::new_v4(),
            STAGING_SUFFIX
        ));

        if let Err(err) = self.stage(temp_path, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }

        let size = match tokio::fs::metadata(&staging).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(PackagerError::StorageFailure(format!(
                    "failed to stat staged archive: {e}"
                )));
            }
        };

        let canonical = self.canonical_path(fingerprint);
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            archive_path: canonical.clone(),
            created_at: self.clock.now(),
            size,
        };

        // With the old entry gone, eviction cannot delete the file renamed
        // over the canonical path below.
        let superseded = self.entries.remove(fingerprint);

        if let Err(e) = tokio::fs::rename(&staging, &canonical).await {
            let _ = tokio::fs::remove_file(&staging).await;
            if let Some((key, previous)) = superseded {
                self.entries.insert(key, previous);
            }
            return Err(PackagerError::StorageFailure(format!(
                "failed to publish {}: {e}",
                canonical.display()
            )));
        }

        if let Some((_, previous)) = superseded {
            warn!(
                "Archive {} superseded an existing entry created at {}",
                fingerprint.short(),
                previous.created_at
            );
        }
        self.entries.insert(fingerprint.clone(), entry.clone());

        debug!("Published {} ({} bytes)", canonical.display(), size);
        Ok(entry)
    }

    async fn stage(&self, temp_path: &Path, staging: &Path) -> Result<(), PackagerError> {
        // Rename fails across filesystems; fall back to copying.
        if tokio::fs::rename(temp_path, staging).await.is_err() {
            tokio::fs::copy(temp_path, staging).await.map_err(|e| {
                PackagerError::StorageFailure(format!(
                    "failed to copy {} into the store: {e}",
                    temp_path.display()
                ))
            })?;
            let _ = tokio::fs::remove_file(temp_path).await;
        }

        let file = tokio::fs::File::open(staging).await?;
        file.sync_all().await?;
        Ok(())
    }

    fn evict_if_expired(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> bool {
        match self.entries.entry(fingerprint.clone()) {
            Entry::Occupied(occupied) if self.is_expired(occupied.get(), now) => {
                let path = occupied.get().archive_path.clone();
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!("Failed to remove expired archive {}: {}", path.display(), e);
                        return false;
                    }
                }
                occupied.remove();
                debug!("Evicted expired archive {}", path.display());
                true
            }
            _ => false,
        }
    }

    /// Remove every entry older than the cache time, with its file.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|entry| self.is_expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter(|fingerprint| self.evict_if_expired(fingerprint, now))
            .count()
    }

    /// Run `evict_expired` every `interval` until the task is aborted.
    pub fn start_eviction_task(
        self: &Arc<Self>,
        interval: Duration,
        metrics: Arc<Metrics>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = store.evict_expired(store.now());
                if evicted > 0 {
                    info!("Evicted {} expired archives", evicted);
                    metrics.record_evictions(evicted);
                }
            }
        })
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
