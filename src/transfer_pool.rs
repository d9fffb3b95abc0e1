// Sig-Vault Transfer Engine
// Semaphore-bounded upload/download jobs with watch-based progress and cooperative cancellation

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, VaultEvent};
use crate::media_cache::{remove_file_quietly, CacheRecord, DownloadMetadata, MediaCache, PARTIAL_SUFFIX};
use crate::path_model::RemotePath;
use crate::providers::{BackendAdapter, BackendId, RemoteRef, VaultError};

/// Unique per engine lifetime
pub type JobId = u64;

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_JOB_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// `Queued → Running → {Succeeded | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Succeeded | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Point-in-time view of one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSnapshot {
    pub id: JobId,
    pub direction: TransferDirection,
    pub remote_ref: RemoteRef,
    pub local_path: PathBuf,
    pub bytes_total: Option<u64>,
    pub bytes_done: u64,
    pub state: TransferState,
    /// Populated iff `state` is `Failed`
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<VaultError>,
    /// Answered from the local cache without a transfer
    pub from_cache: bool,
}

impl TransferSnapshot {
    pub fn backend(&self) -> &BackendId {
        &self.remote_ref.backend
    }
}

fn serialize_error<S: Serializer>(error: &Option<VaultError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => {
            let mut st = s.serialize_struct("TransferError", 2)?;
            st.serialize_field("kind", &e.kind())?;
            st.serialize_field("message", &e.to_string())?;
            st.end()
        }
        None => s.serialize_none(),
    }
}

/// What to transfer. The adapter is captured at submit time, so a job keeps
/// talking to the backend it started on.
pub enum TransferRequest {
    /// Fetch into the cache
    Download {
        adapter: Arc<dyn BackendAdapter>,
        remote_ref: RemoteRef,
    },
    Upload {
        adapter: Arc<dyn BackendAdapter>,
        source: PathBuf,
        destination: RemotePath,
    },
}

/// Configuration for the worker pool
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Jobs allowed in Running at once
    pub max_concurrent: usize,
    /// Upload read size; download chunks come from the adapter
    pub chunk_size: usize,
    /// Finished jobs kept queryable by id; older ones are forgotten
    pub job_history: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            job_history: DEFAULT_JOB_HISTORY,
        }
    }
}

struct JobSlot {
    progress: watch::Sender<TransferSnapshot>,
    cancel: CancellationToken,
}

impl JobSlot {
    /// Apply `f` unless the job is already terminal. Returns the new snapshot
    /// when something changed.
    fn update(&self, f: impl FnOnce(&mut TransferSnapshot) -> bool) -> Option<TransferSnapshot> {
        let changed = self.progress.send_if_modified(|snap| {
            if snap.state.is_terminal() {
                return false;
            }
            f(snap)
        });
        changed.then(|| self.progress.borrow().clone())
    }

    fn snapshot(&self) -> TransferSnapshot {
        self.progress.borrow().clone()
    }
}

/// Why a worker stopped early
enum Stop {
    Cancelled,
    Failed(VaultError),
}

impl From<VaultError> for Stop {
    fn from(e: VaultError) -> Self {
        Stop::Failed(e)
    }
}

impl From<std::io::Error> for Stop {
    fn from(e: std::io::Error) -> Self {
        Stop::Failed(e.into())
    }
}

struct EngineInner {
    settings: EngineSettings,
    semaphore: Arc<Semaphore>,
    jobs: RwLock<HashMap<JobId, Arc<JobSlot>>>,
    /// Terminal jobs, oldest first
    finished: Mutex<VecDeque<JobId>>,
    next_id: AtomicU64,
    cache: Arc<MediaCache>,
    events: EventBus,
}

impl EngineInner {
    fn slot(&self, id: JobId) -> Option<Arc<JobSlot>> {
        self.jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn register(&self, snapshot: TransferSnapshot) -> Arc<JobSlot> {
        let (progress, _) = watch::channel(snapshot.clone());
        let slot = Arc::new(JobSlot {
            progress,
            cancel: CancellationToken::new(),
        });
        self.jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(snapshot.id, slot.clone());
        self.emit_progress(&snapshot);
        if snapshot.state.is_terminal() {
            self.retire(snapshot.id);
        }
        slot
    }

    /// Remember a finished job, forgetting the oldest past `job_history`.
    /// Handles already given out keep their final snapshot.
    fn retire(&self, id: JobId) {
        let expired: Vec<JobId> = {
            let mut finished = self
                .finished
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            finished.push_back(id);
            let excess = finished.len().saturating_sub(self.settings.job_history);
            finished.drain(..excess).collect()
        };
        if expired.is_empty() {
            return;
        }
        let mut jobs = self
            .jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for old in &expired {
            jobs.remove(old);
        }
        tracing::debug!("[Transfer] Forgot {} finished jobs", expired.len());
    }

    fn emit_progress(&self, snap: &TransferSnapshot) {
        self.events.emit(VaultEvent::TransferProgress {
            job_id: snap.id,
            bytes_done: snap.bytes_done,
            bytes_total: snap.bytes_total,
            state: snap.state,
        });
    }

    fn transition(&self, slot: &JobSlot, f: impl FnOnce(&mut TransferSnapshot) -> bool) -> bool {
        match slot.update(f) {
            Some(snap) => {
                self.emit_progress(&snap);
                if snap.state.is_terminal() {
                    self.retire(snap.id);
                }
                true
            }
            None => false,
        }
    }

    /// Count `n` more bytes; a remote that turns out larger than announced
    /// raises `bytes_total` so `bytes_done` never exceeds it.
    fn advance(&self, slot: &JobSlot, n: usize) {
        if slot.cancel.is_cancelled() {
            return;
        }
        self.transition(slot, |snap| {
            if snap.state != TransferState::Running {
                return false;
            }
            snap.bytes_done += n as u64;
            if let Some(total) = snap.bytes_total {
                if snap.bytes_done > total {
                    snap.bytes_total = Some(snap.bytes_done);
                }
            }
            true
        });
    }

    fn set_total(&self, slot: &JobSlot, total: Option<u64>) {
        self.transition(slot, |snap| {
            snap.bytes_total = total.map(|t| t.max(snap.bytes_done));
            true
        });
    }

    fn finish(&self, slot: &JobSlot, outcome: Result<(), Stop>) {
        let id = slot.snapshot().id;
        match outcome {
            Ok(()) => {
                self.transition(slot, |snap| {
                    snap.state = TransferState::Succeeded;
                    true
                });
                tracing::info!("[Transfer] Job {} succeeded", id);
            }
            Err(Stop::Cancelled) => {
                if self.transition(slot, |snap| {
                    snap.state = TransferState::Cancelled;
                    true
                }) {
                    tracing::info!("[Transfer] Job {} cancelled", id);
                }
            }
            Err(Stop::Failed(err)) => {
                let kind = err.kind();
                let message = err.to_string();
                let failed = self.transition(slot, |snap| {
                    snap.state = TransferState::Failed;
                    snap.error = Some(err);
                    true
                });
                if failed {
                    tracing::error!("[Transfer] Job {} failed: {}", id, message);
                    self.events.emit(VaultEvent::TransferFailed {
                        job_id: id,
                        error_kind: kind,
                        message,
                    });
                }
            }
        }
    }
}

/// Transfer Engine
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(settings: EngineSettings, cache: Arc<MediaCache>, events: EventBus) -> Self {
        let settings = EngineSettings {
            max_concurrent: settings.max_concurrent.max(1),
            chunk_size: settings.chunk_size.max(1),
            job_history: settings.job_history.max(1),
        };
        tracing::debug!(
            "[Transfer] Engine with {} workers, {} byte chunks",
            settings.max_concurrent,
            settings.chunk_size
        );
        Self {
            inner: Arc::new(EngineInner {
                settings,
                semaphore: Arc::new(Semaphore::new(settings.max_concurrent)),
                jobs: RwLock::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
                cache,
                events,
            }),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.inner.settings
    }

    /// Enqueue a job. Never fails; the transfer runs on a spawned task, so
    /// this must be called from within a tokio runtime.
    pub fn submit(&self, request: TransferRequest) -> TransferHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (direction, remote_ref, local_path) = match &request {
            TransferRequest::Download { remote_ref, .. } => (
                TransferDirection::Download,
                remote_ref.clone(),
                self.inner.cache.allocate_path(remote_ref),
            ),
            TransferRequest::Upload {
                adapter,
                source,
                destination,
            } => (
                TransferDirection::Upload,
                RemoteRef::new(adapter.backend_id().clone(), destination.clone()),
                source.clone(),
            ),
        };
        let slot = self.inner.register(TransferSnapshot {
            id,
            direction,
            remote_ref,
            local_path,
            bytes_total: None,
            bytes_done: 0,
            state: TransferState::Queued,
            error: None,
            from_cache: false,
        });
        tracing::debug!("[Transfer] Job {} queued", id);

        let handle = TransferHandle {
            id,
            rx: slot.progress.subscribe(),
        };
        tokio::spawn(run_job(self.inner.clone(), slot, request));
        handle
    }

    /// Register an already-Succeeded job pointing at a cached file
    pub fn complete_from_cache(&self, record: &CacheRecord) -> TransferHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = self.inner.register(TransferSnapshot {
            id,
            direction: TransferDirection::Download,
            remote_ref: record.remote_ref.clone(),
            local_path: record.local_path.clone(),
            bytes_total: Some(record.size_at_download),
            bytes_done: record.size_at_download,
            state: TransferState::Succeeded,
            error: None,
            from_cache: true,
        });
        tracing::debug!("[Transfer] Job {} served from cache", id);
        TransferHandle {
            id,
            rx: slot.progress.subscribe(),
        }
    }

    /// Request cancellation. A Queued job is Cancelled immediately; a Running
    /// job stops at its next chunk boundary. Terminal jobs are left alone.
    pub fn cancel(&self, id: JobId) -> Result<(), VaultError> {
        let slot = self.inner.slot(id).ok_or(VaultError::UnknownJob(id))?;
        if slot.snapshot().state.is_terminal() {
            return Ok(());
        }
        slot.cancel.cancel();
        let dequeued = self.inner.transition(&slot, |snap| {
            if snap.state != TransferState::Queued {
                return false;
            }
            snap.state = TransferState::Cancelled;
            true
        });
        if dequeued {
            tracing::info!("[Transfer] Job {} cancelled before starting", id);
        } else {
            tracing::debug!("[Transfer] Cancellation requested for job {}", id);
        }
        Ok(())
    }

    /// Progress snapshots for `id`, ending with its terminal state
    pub fn subscribe(&self, id: JobId) -> Result<ProgressSubscription, VaultError> {
        let slot = self.inner.slot(id).ok_or(VaultError::UnknownJob(id))?;
        Ok(ProgressSubscription {
            rx: slot.progress.subscribe(),
            started: false,
            done: false,
        })
    }

    pub fn job(&self, id: JobId) -> Option<TransferSnapshot> {
        self.inner.slot(id).map(|slot| slot.snapshot())
    }

    /// All jobs, in submission order
    pub fn jobs(&self) -> Vec<TransferSnapshot> {
        let mut all: Vec<TransferSnapshot> = self
            .inner
            .jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }
}

/// Returned by `submit`; follows one job
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: JobId,
    rx: watch::Receiver<TransferSnapshot>,
}

impl TransferHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.rx.borrow().clone()
    }

    /// Progress of this job; works even after the engine has forgotten it
    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription {
            rx: self.rx.clone(),
            started: false,
            done: false,
        }
    }

    /// Wait for the terminal snapshot
    pub async fn wait(mut self) -> TransferSnapshot {
        if let Ok(snap) = self.rx.wait_for(|s| s.state.is_terminal()).await {
            return snap.clone();
        }
        // engine gone; report the last known state
        self.rx.borrow().clone()
    }
}

/// Lazy, finite sequence of snapshots for one job.
///
/// Intermediate values may be coalesced, but `bytes_done` never goes down
/// and the terminal snapshot is always delivered last.
pub struct ProgressSubscription {
    rx: watch::Receiver<TransferSnapshot>,
    started: bool,
    done: bool,
}

impl ProgressSubscription {
    pub async fn next(&mut self) -> Option<TransferSnapshot> {
        if self.done {
            return None;
        }
        if self.started && self.rx.changed().await.is_err() {
            self.done = true;
            return None;
        }
        self.started = true;
        let snap = self.rx.borrow_and_update().clone();
        if snap.state.is_terminal() {
            self.done = true;
        }
        Some(snap)
    }

    pub fn into_stream(self) -> impl Stream<Item = TransferSnapshot> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|snap| (snap, sub))
        })
    }
}

async fn run_job(inner: Arc<EngineInner>, slot: Arc<JobSlot>, request: TransferRequest) {
    let permit = tokio::select! {
        biased;
        _ = slot.cancel.cancelled() => {
            inner.finish(&slot, Err(Stop::Cancelled));
            return;
        }
        permit = inner.semaphore.clone().acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        inner.finish(&slot, Err(Stop::Failed(VaultError::ConnectionError(
            "transfer pool shut down".to_string(),
        ))));
        return;
    };

    let started = inner.transition(&slot, |snap| {
        if snap.state != TransferState::Queued {
            return false;
        }
        snap.state = TransferState::Running;
        true
    });
    if !started {
        return;
    }

    let snap = slot.snapshot();
    tracing::info!(
        "[Transfer] Job {} started: {:?} {}",
        snap.id,
        snap.direction,
        snap.remote_ref
    );
    let outcome = match request {
        TransferRequest::Download { adapter, remote_ref } => {
            download(&inner, &slot, adapter.as_ref(), &remote_ref, &snap.local_path).await
        }
        TransferRequest::Upload {
            adapter,
            source,
            destination,
        } => upload(&inner, &slot, adapter.as_ref(), &source, &destination).await,
    };
    inner.finish(&slot, outcome);
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

async fn download(
    inner: &EngineInner,
    slot: &JobSlot,
    adapter: &dyn BackendAdapter,
    remote_ref: &RemoteRef,
    dest: &Path,
) -> Result<(), Stop> {
    let part = partial_path(dest);
    let result = fetch(inner, slot, adapter, remote_ref, dest, &part).await;
    if result.is_err() {
        // Never leave a truncated file behind for the cache to find
        remove_file_quietly(&part).await;
        remove_file_quietly(dest).await;
    }
    if let Err(Stop::Failed(VaultError::NotFound(_))) = &result {
        if let Err(e) = inner.cache.remove(remote_ref).await {
            tracing::warn!("[Transfer] Failed to drop cache record for {}: {}", remote_ref, e);
        }
    }
    result
}

async fn fetch(
    inner: &EngineInner,
    slot: &JobSlot,
    adapter: &dyn BackendAdapter,
    remote_ref: &RemoteRef,
    dest: &Path,
    part: &Path,
) -> Result<(), Stop> {
    let cancel = &slot.cancel;
    let entry = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Stop::Cancelled),
        entry = adapter.stat_entry(remote_ref) => entry?,
    };
    if entry.is_dir() {
        return Err(Stop::Failed(VaultError::InvalidName(format!(
            "{} is a directory",
            remote_ref.path
        ))));
    }
    inner.set_total(slot, entry.size());

    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Stop::Cancelled),
        stream = adapter.open_for_read(remote_ref) => stream?,
    };
    let mut file = tokio::fs::File::create(part).await?;
    let mut written: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Stop::Cancelled),
            next = stream.try_next() => next?,
        };
        let Some(chunk) = next else {
            break;
        };
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        inner.advance(slot, chunk.len());
    }
    drop(stream);
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if cancel.is_cancelled() {
        return Err(Stop::Cancelled);
    }
    tokio::fs::rename(part, dest).await?;
    inner
        .cache
        .record_completed_download(
            remote_ref,
            dest,
            DownloadMetadata {
                size: written,
                modified_at: entry.modified_at(),
            },
        )
        .await?;
    Ok(())
}

async fn upload(
    inner: &EngineInner,
    slot: &JobSlot,
    adapter: &dyn BackendAdapter,
    source: &Path,
    destination: &RemotePath,
) -> Result<(), Stop> {
    let cancel = &slot.cancel;
    // A cached source must not be evicted while we read it
    let _pin = inner.cache.pin_path(source);

    let mut file = tokio::fs::File::open(source).await?;
    let size = file.metadata().await?.len();
    inner.set_total(slot, Some(size));

    let mut sink = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Stop::Cancelled),
        sink = adapter.open_for_write(destination, Some(size)) => sink?,
    };

    let mut buf = vec![0u8; inner.settings.chunk_size];
    loop {
        if cancel.is_cancelled() {
            sink.abort().await;
            return Err(Stop::Cancelled);
        }
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                sink.abort().await;
                return Err(e.into());
            }
        };
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = sink.write(Bytes::copy_from_slice(&buf[..n])) => Some(result),
        };
        match written {
            None => {
                sink.abort().await;
                return Err(Stop::Cancelled);
            }
            Some(Err(e)) => {
                sink.abort().await;
                return Err(e.into());
            }
            Some(Ok(())) => inner.advance(slot, n),
        }
    }

    if cancel.is_cancelled() {
        sink.abort().await;
        return Err(Stop::Cancelled);
    }
    sink.commit().await?;
    Ok(())
}
