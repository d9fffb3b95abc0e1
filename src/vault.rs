//! Vault coordinator
//!
//! Owns the active backend, the transfer engine and the media cache. Exactly
//! one backend is active at a time; switching supersedes listings still in
//! flight against the old one, while transfers keep the adapter they were
//! submitted with.

use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, EventSubscription, VaultEvent};
use crate::media_cache::{CacheRecord, EvictionReport, MediaCache};
use crate::path_model::RemotePath;
use crate::providers::{
    AdapterFactory, Backend, BackendAdapter, BackendSummary, DefaultAdapterFactory, Entry,
    RemoteRef, StorageQuota, VaultError,
};
use crate::transfer_pool::{
    EngineSettings, JobId, ProgressSubscription, TransferEngine, TransferHandle, TransferRequest,
    TransferSnapshot,
};
use crate::vault_config::VaultConfig;

struct ActiveBackend {
    backend: Backend,
    adapter: Arc<dyn BackendAdapter>,
    /// Cancelled when another backend becomes active
    listings: CancellationToken,
}

pub struct Vault {
    factory: Arc<dyn AdapterFactory>,
    active: RwLock<Option<Arc<ActiveBackend>>>,
    engine: TransferEngine,
    cache: Arc<MediaCache>,
    events: EventBus,
}

impl Vault {
    pub fn new(factory: Arc<dyn AdapterFactory>, cache: Arc<MediaCache>, settings: EngineSettings) -> Self {
        let events = EventBus::new();
        let engine = TransferEngine::new(settings, cache.clone(), events.clone());
        Self {
            factory,
            active: RwLock::new(None),
            engine,
            cache,
            events,
        }
    }

    /// Open the cache and activate the configured default backend. Fails with
    /// `InvalidConfig` when that backend is not usable.
    pub async fn open(config: &VaultConfig) -> Result<Self, VaultError> {
        let backend = config.backend(config.default_mode)?;
        let cache = MediaCache::open(config.cache.resolved_dir(), config.cache.max_bytes).await?;
        let factory = Arc::new(DefaultAdapterFactory::new(config.transfers.connection()));
        let vault = Self::new(factory, Arc::new(cache), config.transfers.engine());
        vault.set_active_backend(backend)?;
        Ok(vault)
    }

    /// Make `backend` the active one. In-flight listings on the previous
    /// backend resolve to `Superseded`; its transfers are left alone.
    pub fn set_active_backend(&self, backend: Backend) -> Result<BackendSummary, VaultError> {
        let adapter = self.factory.create(&backend)?;
        let summary = backend.summary();
        let next = Arc::new(ActiveBackend {
            backend,
            adapter,
            listings: CancellationToken::new(),
        });
        let previous = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(next);
        if let Some(previous) = previous {
            previous.listings.cancel();
        }
        tracing::info!("[Vault] Active backend: {}", summary.display_name);
        self.events.emit(VaultEvent::BackendSwitched {
            backend: summary.clone(),
        });
        Ok(summary)
    }

    fn current(&self) -> Result<Arc<ActiveBackend>, VaultError> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(VaultError::NoActiveBackend)
    }

    pub fn active_backend(&self) -> Option<BackendSummary> {
        self.current().ok().map(|a| a.backend.summary())
    }

    /// Parse `raw` in the active backend's path flavor
    pub fn parse_path(&self, raw: &str) -> Result<RemotePath, VaultError> {
        let active = self.current()?;
        RemotePath::parse(active.backend.kind().flavor(), raw)
    }

    /// `RemoteRef` for `raw` on the active backend
    pub fn remote_ref(&self, raw: &str) -> Result<RemoteRef, VaultError> {
        let active = self.current()?;
        let path = RemotePath::parse(active.backend.kind().flavor(), raw)?;
        Ok(RemoteRef::new(active.backend.id(), path))
    }

    /// Adapter serving `remote_ref`; only the active backend is reachable
    fn adapter_for(&self, remote_ref: &RemoteRef) -> Result<Arc<dyn BackendAdapter>, VaultError> {
        let active = self.current()?;
        if active.adapter.backend_id() != &remote_ref.backend {
            tracing::debug!(
                "[Vault] {} belongs to {}, not the active backend",
                remote_ref.path,
                remote_ref.backend
            );
            return Err(VaultError::NoActiveBackend);
        }
        Ok(active.adapter.clone())
    }

    /// List `path` on the active backend, directories first
    pub async fn browse(&self, path: &RemotePath) -> Result<Vec<Entry>, VaultError> {
        let active = self.current()?;
        if path.flavor() != active.backend.kind().flavor() {
            return Err(VaultError::InvalidName(format!(
                "{} is not a {} path",
                path,
                active.backend.kind()
            )));
        }

        let entries = tokio::select! {
            biased;
            _ = active.listings.cancelled() => return Err(VaultError::Superseded),
            listing = active.adapter.list_directory(path) => listing?,
        };
        if active.listings.is_cancelled() {
            return Err(VaultError::Superseded);
        }

        for entry in entries.iter().filter(|e| !e.is_dir()) {
            if let Err(e) = self
                .cache
                .mark_stale_if_newer(entry.remote_ref(), entry.modified_at())
                .await
            {
                tracing::warn!("[Vault] Could not update cache freshness: {}", e);
            }
        }

        tracing::debug!("[Vault] Listed {} ({} entries)", path, entries.len());
        self.events.emit(VaultEvent::DirectoryListed {
            backend: active.backend.id().to_string(),
            path: path.to_string(),
            entries: entries.clone(),
        });
        Ok(entries)
    }

    pub async fn browse_path(&self, raw: &str) -> Result<Vec<Entry>, VaultError> {
        let path = self.parse_path(raw)?;
        self.browse(&path).await
    }

    /// Download through the cache. A fresh record is answered with an
    /// already-Succeeded job and no network traffic.
    pub async fn download(&self, remote_ref: &RemoteRef) -> Result<TransferHandle, VaultError> {
        if let Some(record) = self.cache.lookup(remote_ref).await {
            if record.is_fresh() {
                tracing::debug!("[Vault] {} served from cache", remote_ref);
                return Ok(self.engine.complete_from_cache(&record));
            }
        }
        let adapter = self.adapter_for(remote_ref)?;
        Ok(self.engine.submit(TransferRequest::Download {
            adapter,
            remote_ref: remote_ref.clone(),
        }))
    }

    pub async fn download_path(&self, raw: &str) -> Result<TransferHandle, VaultError> {
        let remote_ref = self.remote_ref(raw)?;
        self.download(&remote_ref).await
    }

    /// Upload `local` into the remote directory `remote_dir`, keeping the
    /// local file name. An unusable name is rejected before any job exists.
    pub async fn upload(&self, local: &Path, remote_dir: &RemotePath) -> Result<TransferHandle, VaultError> {
        let active = self.current()?;
        if remote_dir.flavor() != active.backend.kind().flavor() {
            return Err(VaultError::InvalidName(format!(
                "{} is not a {} path",
                remote_dir,
                active.backend.kind()
            )));
        }
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VaultError::InvalidName(local.display().to_string()))?;
        let destination = remote_dir.join(name)?;

        // Fail fast when the backend says the file cannot fit
        match active.adapter.quota().await {
            Ok(Some(quota)) => {
                if let Ok(meta) = tokio::fs::metadata(local).await {
                    if !quota.fits(meta.len()) {
                        return Err(VaultError::QuotaExceeded(format!(
                            "{} needs {} bytes, {} free",
                            name,
                            meta.len(),
                            quota.free.unwrap_or(0)
                        )));
                    }
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("[Vault] Quota unavailable, uploading anyway: {}", e),
        }

        // Whatever we cached for the destination is about to be replaced
        let dest_ref = RemoteRef::new(active.backend.id(), destination.clone());
        self.cache.invalidate(&dest_ref).await?;

        Ok(self.engine.submit(TransferRequest::Upload {
            adapter: active.adapter.clone(),
            source: local.to_path_buf(),
            destination,
        }))
    }

    /// Storage used and left on the active backend, if it reports one
    pub async fn quota(&self) -> Result<Option<StorageQuota>, VaultError> {
        self.current()?.adapter.quota().await
    }

    /// Re-validate a cached record against the backend. A vanished remote
    /// drops the record and its file.
    pub async fn check_freshness(&self, remote_ref: &RemoteRef) -> Result<Option<CacheRecord>, VaultError> {
        let adapter = self.adapter_for(remote_ref)?;
        match adapter.stat_entry(remote_ref).await {
            Ok(entry) => {
                self.cache
                    .mark_stale_if_newer(remote_ref, entry.modified_at())
                    .await?;
                Ok(self.cache.lookup(remote_ref).await)
            }
            Err(VaultError::NotFound(_)) => {
                if self.cache.remove(remote_ref).await? {
                    tracing::info!("[Vault] {} is gone from the backend, dropped from cache", remote_ref);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn invalidate(&self, remote_ref: &RemoteRef) -> Result<bool, VaultError> {
        self.cache.invalidate(remote_ref).await
    }

    pub async fn evict(&self, target_freed_bytes: u64) -> Result<EvictionReport, VaultError> {
        self.cache.evict_least_recently_fetched(target_freed_bytes).await
    }

    pub fn cancel(&self, id: JobId) -> Result<(), VaultError> {
        self.engine.cancel(id)
    }

    pub fn subscribe(&self, id: JobId) -> Result<ProgressSubscription, VaultError> {
        self.engine.subscribe(id)
    }

    pub fn job(&self, id: JobId) -> Option<TransferSnapshot> {
        self.engine.job(id)
    }

    pub fn jobs(&self) -> Vec<TransferSnapshot> {
        self.engine.jobs()
    }

    pub fn events(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<MediaCache> {
        &self.cache
    }
}
