//! Local media cache
//!
//! Maps remote objects to downloaded files under `<cache_dir>/media/` and
//! keeps a durable index at `<cache_dir>/index.json`. Readers go through a
//! shared lock; every mutation (record, invalidate, evict, self-heal) is
//! serialized behind one async writer lock so the index on disk always
//! matches a state readers could have observed.
//!
//! A record is removed from the map before its file is deleted, and a
//! replacement file is in place before the map is switched to it, so
//! `lookup` never hands out a record whose file is already gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex as AsyncMutex;

use crate::providers::{extension_of, RemoteRef, VaultError};

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;
const MEDIA_DIR: &str = "media";
/// Suffix of in-flight download files
pub const PARTIAL_SUFFIX: &str = ".part";

/// Metadata for one locally stored download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub remote_ref: RemoteRef,
    pub local_path: PathBuf,
    pub size_at_download: u64,
    pub modified_at_of_remote_when_fetched: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    /// Set when the remote was seen to change; the file stays usable
    #[serde(default)]
    pub stale: bool,
}

impl CacheRecord {
    pub fn is_fresh(&self) -> bool {
        !self.stale
    }
}

/// What the transfer knew about the remote object it fetched
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadMetadata {
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    pub freed_bytes: u64,
    pub evicted: Vec<RemoteRef>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    records: BTreeMap<String, CacheRecord>,
}

type PinTable = Arc<Mutex<HashMap<String, usize>>>;

fn lock_pins(pins: &Mutex<HashMap<String, usize>>) -> MutexGuard<'_, HashMap<String, usize>> {
    pins.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps a record from being evicted while held
#[derive(Debug)]
pub struct CachePin {
    key: String,
    pins: PinTable,
}

impl Drop for CachePin {
    fn drop(&mut self) {
        let mut pins = lock_pins(&self.pins);
        if let Some(count) = pins.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.key);
            }
        }
    }
}

/// Local Cache
pub struct MediaCache {
    root: PathBuf,
    media_dir: PathBuf,
    max_bytes: Option<u64>,
    records: RwLock<HashMap<String, CacheRecord>>,
    writer: AsyncMutex<()>,
    pins: PinTable,
}

impl MediaCache {
    /// Open (or create) the cache rooted at `root`.
    ///
    /// Records whose files have vanished are dropped, leftover partial
    /// downloads and unreferenced media files are deleted. An unreadable
    /// index is moved aside and the cache starts empty.
    pub async fn open(root: impl Into<PathBuf>, max_bytes: Option<u64>) -> Result<Self, VaultError> {
        let root = root.into();
        let media_dir = root.join(MEDIA_DIR);
        tokio::fs::create_dir_all(&media_dir).await?;

        let mut records = load_index(&root).await?;
        let before = records.len();
        let mut healed = HashMap::with_capacity(records.len());
        for (key, record) in records.drain() {
            if tokio::fs::try_exists(&record.local_path).await.unwrap_or(false) {
                healed.insert(key, record);
            } else {
                tracing::warn!(
                    "[Cache] Dropping record for {}: {} is missing",
                    key,
                    record.local_path.display()
                );
            }
        }

        let cache = Self {
            root,
            media_dir,
            max_bytes,
            records: RwLock::new(healed),
            writer: AsyncMutex::new(()),
            pins: Arc::new(Mutex::new(HashMap::new())),
        };
        cache.sweep_media_dir().await?;
        if cache.read().len() != before {
            let _guard = cache.writer.lock().await;
            cache.persist().await?;
        }
        tracing::info!(
            "[Cache] Opened {} with {} records ({} bytes)",
            cache.root.display(),
            cache.read().len(),
            cache.total_bytes()
        );
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheRecord>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current record for `remote_ref`, stale or not.
    ///
    /// A record whose file has disappeared is removed on the spot and
    /// reported as absent.
    pub async fn lookup(&self, remote_ref: &RemoteRef) -> Option<CacheRecord> {
        let key = remote_ref.cache_key();
        let record = self.read().get(&key).cloned()?;
        if tokio::fs::try_exists(&record.local_path).await.unwrap_or(false) {
            return Some(record);
        }

        let err = VaultError::CacheCorruption(format!(
            "{} recorded at {} but the file is missing",
            key,
            record.local_path.display()
        ));
        tracing::warn!("[Cache] {}; removing stray record", err);
        let _guard = self.writer.lock().await;
        let removed = {
            let mut records = self.write();
            match records.get(&key) {
                Some(current) if current.local_path == record.local_path => records.remove(&key),
                _ => None,
            }
        };
        if removed.is_some() {
            if let Err(e) = self.persist().await {
                tracing::warn!("[Cache] Failed to persist index: {}", e);
            }
        }
        None
    }

    /// Fresh local path for downloading `remote_ref`
    pub fn allocate_path(&self, remote_ref: &RemoteRef) -> PathBuf {
        let digest = hex::encode(Sha256::digest(remote_ref.cache_key().as_bytes()));
        let mut name = format!("{}-{}", &digest[..16], uuid::Uuid::new_v4().simple());
        if let Some(ext) = remote_ref.name().and_then(extension_of) {
            name.push('.');
            name.push_str(&ext);
        }
        self.media_dir.join(name)
    }

    /// Create or replace the record for `remote_ref`.
    ///
    /// `local_path` must already hold the complete file; a size mismatch is
    /// refused. The file of a replaced record is deleted only after the new
    /// record is visible.
    pub async fn record_completed_download(
        &self,
        remote_ref: &RemoteRef,
        local_path: &Path,
        metadata: DownloadMetadata,
    ) -> Result<CacheRecord, VaultError> {
        let on_disk = tokio::fs::metadata(local_path).await?;
        if on_disk.len() != metadata.size {
            return Err(VaultError::CacheCorruption(format!(
                "{} holds {} bytes, expected {}",
                local_path.display(),
                on_disk.len(),
                metadata.size
            )));
        }

        let key = remote_ref.cache_key();
        let record = CacheRecord {
            remote_ref: remote_ref.clone(),
            local_path: local_path.to_path_buf(),
            size_at_download: metadata.size,
            modified_at_of_remote_when_fetched: metadata.modified_at,
            fetched_at: Utc::now(),
            stale: false,
        };

        let _guard = self.writer.lock().await;
        let previous = self.write().insert(key.clone(), record.clone());
        if let Err(e) = self.persist().await {
            // Memory must keep matching the index on disk
            {
                let mut records = self.write();
                match previous {
                    Some(old) => records.insert(key.clone(), old),
                    None => records.remove(&key),
                };
            }
            tracing::warn!("[Cache] Could not record {}: {}", key, e);
            return Err(e);
        }
        if let Some(old) = previous {
            if old.local_path != record.local_path {
                remove_file_quietly(&old.local_path).await;
            }
        }
        tracing::debug!("[Cache] Recorded {} ({} bytes)", key, metadata.size);

        // The download is committed; a failing size bound only gets logged
        if let Some(max) = self.max_bytes {
            let total = self.total_bytes();
            if total > max {
                match self.evict_locked(total - max, Some(&key)).await {
                    Ok(report) => tracing::info!(
                        "[Cache] Size bound {} exceeded, evicted {} records ({} bytes)",
                        max,
                        report.evicted.len(),
                        report.freed_bytes
                    ),
                    Err(e) => tracing::warn!("[Cache] Size bound {} not restored: {}", max, e),
                }
            }
        }
        Ok(record)
    }

    /// Mark for refresh; the file stays usable. Returns whether a record existed.
    pub async fn invalidate(&self, remote_ref: &RemoteRef) -> Result<bool, VaultError> {
        let _guard = self.writer.lock().await;
        let changed = match self.write().get_mut(&remote_ref.cache_key()) {
            Some(record) => {
                record.stale = true;
                true
            }
            None => false,
        };
        if changed {
            self.persist().await?;
            tracing::debug!("[Cache] Invalidated {}", remote_ref);
        }
        Ok(changed)
    }

    /// Mark stale when the remote reports a newer modification time than the
    /// one fetched. Returns whether the record was newly marked.
    pub async fn mark_stale_if_newer(
        &self,
        remote_ref: &RemoteRef,
        remote_modified: Option<DateTime<Utc>>,
    ) -> Result<bool, VaultError> {
        let Some(remote_modified) = remote_modified else {
            return Ok(false);
        };
        let key = remote_ref.cache_key();
        let needs_mark = self.read().get(&key).is_some_and(|r| is_newer(r, remote_modified));
        if !needs_mark {
            return Ok(false);
        }

        let _guard = self.writer.lock().await;
        let marked = match self.write().get_mut(&key) {
            Some(record) if is_newer(record, remote_modified) => {
                record.stale = true;
                true
            }
            _ => false,
        };
        if marked {
            self.persist().await?;
            tracing::info!("[Cache] {} changed remotely, marked stale", key);
        }
        Ok(marked)
    }

    /// Drop the record and its file. Returns whether a record existed.
    pub async fn remove(&self, remote_ref: &RemoteRef) -> Result<bool, VaultError> {
        let _guard = self.writer.lock().await;
        let removed = self.write().remove(&remote_ref.cache_key());
        match removed {
            Some(record) => {
                self.persist().await?;
                remove_file_quietly(&record.local_path).await;
                tracing::debug!("[Cache] Removed {}", remote_ref);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove records, oldest fetch first, until `target_freed_bytes` is
    /// reached or nothing evictable is left. Pinned records are skipped.
    pub async fn evict_least_recently_fetched(
        &self,
        target_freed_bytes: u64,
    ) -> Result<EvictionReport, VaultError> {
        let _guard = self.writer.lock().await;
        self.evict_locked(target_freed_bytes, None).await
    }

    /// Caller holds the writer lock
    async fn evict_locked(
        &self,
        target_freed_bytes: u64,
        keep: Option<&str>,
    ) -> Result<EvictionReport, VaultError> {
        let mut report = EvictionReport::default();
        let mut doomed = Vec::new();
        {
            // Pins are checked and records dropped under the pin table lock,
            // so a pin taken concurrently either wins or sees no record.
            let pins = lock_pins(&self.pins);
            let mut records = self.write();
            let mut candidates: Vec<(DateTime<Utc>, String)> = records
                .iter()
                .filter(|(k, _)| Some(k.as_str()) != keep && !pins.contains_key(*k))
                .map(|(k, r)| (r.fetched_at, k.clone()))
                .collect();
            candidates.sort();

            for (_, key) in candidates {
                if report.freed_bytes >= target_freed_bytes {
                    break;
                }
                if let Some(record) = records.remove(&key) {
                    report.freed_bytes += record.size_at_download;
                    report.evicted.push(record.remote_ref.clone());
                    doomed.push((key, record));
                }
            }
        }
        if doomed.is_empty() {
            return Ok(report);
        }
        if let Err(e) = self.persist().await {
            // Files are still in place, so the records go back
            let mut records = self.write();
            for (key, record) in doomed {
                records.insert(key, record);
            }
            return Err(e);
        }
        for (_, record) in doomed {
            remove_file_quietly(&record.local_path).await;
        }
        tracing::debug!(
            "[Cache] Evicted {} records, freed {} bytes",
            report.evicted.len(),
            report.freed_bytes
        );
        Ok(report)
    }

    /// All records, oldest fetch first
    pub fn records(&self) -> Vec<CacheRecord> {
        let mut all: Vec<CacheRecord> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.fetched_at.cmp(&b.fetched_at));
        all
    }

    pub fn total_bytes(&self) -> u64 {
        self.read().values().map(|r| r.size_at_download).sum()
    }

    /// Pin `remote_ref` against eviction for the guard's lifetime
    pub fn pin(&self, remote_ref: &RemoteRef) -> CachePin {
        self.pin_key(remote_ref.cache_key())
    }

    /// Pin the record whose file is `local_path`, if any
    pub fn pin_path(&self, local_path: &Path) -> Option<CachePin> {
        let mut pins = lock_pins(&self.pins);
        let key = self
            .read()
            .iter()
            .find(|(_, r)| r.local_path == local_path)
            .map(|(k, _)| k.clone())?;
        *pins.entry(key.clone()).or_insert(0) += 1;
        Some(CachePin {
            key,
            pins: self.pins.clone(),
        })
    }

    fn pin_key(&self, key: String) -> CachePin {
        *lock_pins(&self.pins).entry(key.clone()).or_insert(0) += 1;
        CachePin {
            key,
            pins: self.pins.clone(),
        }
    }

    /// Write the index through a temporary file. Caller holds the writer lock.
    async fn persist(&self) -> Result<(), VaultError> {
        let index = CacheIndex {
            version: INDEX_VERSION,
            records: self
                .read()
                .iter()
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect(),
        };
        let data = serde_json::to_vec_pretty(&index)
            .map_err(|e| VaultError::CacheCorruption(format!("serialize index: {}", e)))?;
        let path = self.root.join(INDEX_FILE);
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Delete partial downloads and files no record points at
    async fn sweep_media_dir(&self) -> Result<(), VaultError> {
        let referenced: HashSet<PathBuf> = self.read().values().map(|r| r.local_path.clone()).collect();
        let mut dir = tokio::fs::read_dir(&self.media_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if referenced.contains(&path) {
                continue;
            }
            if item.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                tracing::debug!("[Cache] Removing leftover {}", path.display());
                remove_file_quietly(&path).await;
            }
        }
        Ok(())
    }
}

fn is_newer(record: &CacheRecord, remote_modified: DateTime<Utc>) -> bool {
    !record.stale
        && record
            .modified_at_of_remote_when_fetched
            .is_some_and(|fetched| remote_modified > fetched)
}

async fn load_index(root: &Path) -> Result<HashMap<String, CacheRecord>, VaultError> {
    let path = root.join(INDEX_FILE);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice::<CacheIndex>(&data) {
        Ok(index) => Ok(index.records.into_iter().collect()),
        Err(e) => {
            let aside = root.join(format!(
                "{}.corrupt-{}",
                INDEX_FILE,
                Utc::now().format("%Y%m%d%H%M%S")
            ));
            tracing::warn!(
                "[Cache] Index unreadable ({}), moved to {}",
                e,
                aside.display()
            );
            tokio::fs::rename(&path, &aside).await?;
            Ok(HashMap::new())
        }
    }
}

pub(crate) async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("[Cache] Failed to remove {}: {}", path.display(), e);
        }
    }
}
