//! In-memory backend
//!
//! Holds files in a map and speaks the full `BackendAdapter` contract. Faults
//! can be injected (failed reads after N bytes, failed commits, failed
//! listings) and reads and listings can be held behind a gate, which makes the
//! transfer engine's Running state observable without timing tricks.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use super::{
    AdapterFactory, Backend, BackendAdapter, BackendId, BackendKind, ByteSink, ByteStream,
    Entry, EntryKind, RemoteRef, StorageQuota, VaultError,
};
use crate::path_model::{finalize_listing, normalize, RemotePath};

type Key = Vec<String>;
type RawChild = (String, EntryKind, Option<u64>, Option<DateTime<Utc>>);

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Bytes,
    modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct MemoryState {
    files: BTreeMap<Key, MemoryFile>,
    dirs: BTreeSet<Key>,
    raw_listings: HashMap<Key, Vec<(String, EntryKind)>>,
    fail_reads_after: Option<usize>,
    fail_commit: Option<VaultError>,
    fail_listing: Option<VaultError>,
    chunk_size: usize,
    quota: Option<StorageQuota>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory `BackendAdapter`
pub struct MemoryAdapter {
    id: BackendId,
    kind: BackendKind,
    state: Arc<Mutex<MemoryState>>,
    gate: watch::Sender<bool>,
    reads: AtomicUsize,
    invalidations: Arc<AtomicUsize>,
}

impl MemoryAdapter {
    pub fn new(id: BackendId, kind: BackendKind) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            id,
            kind,
            state: Arc::new(Mutex::new(MemoryState {
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                raw_listings: HashMap::new(),
                fail_reads_after: None,
                fail_commit: None,
                fail_listing: None,
                chunk_size: 4,
                quota: None,
            })),
            gate,
            reads: AtomicUsize::new(0),
            invalidations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn for_backend(backend: &Backend) -> Self {
        Self::new(backend.id(), backend.kind())
    }

    fn parse(&self, path: &str) -> Result<RemotePath, VaultError> {
        RemotePath::parse(self.kind.flavor(), path)
    }

    /// Store a file, creating its parent directories
    pub fn put_file(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<RemoteRef, VaultError> {
        let path = self.parse(path)?;
        let key = path.segments().to_vec();
        let mut state = lock(&self.state);
        add_parents(&mut state.dirs, &key);
        state.files.insert(
            key,
            MemoryFile {
                data: data.into(),
                modified_at,
            },
        );
        Ok(RemoteRef::new(self.id.clone(), path))
    }

    pub fn make_dir(&self, path: &str) -> Result<(), VaultError> {
        let path = self.parse(path)?;
        let key = path.segments().to_vec();
        let mut state = lock(&self.state);
        add_parents(&mut state.dirs, &key);
        state.dirs.insert(key);
        Ok(())
    }

    pub fn remove_file(&self, path: &str) -> Result<(), VaultError> {
        let path = self.parse(path)?;
        lock(&self.state).files.remove(path.segments());
        Ok(())
    }

    pub fn file(&self, path: &str) -> Option<Bytes> {
        let path = self.parse(path).ok()?;
        lock(&self.state)
            .files
            .get(path.segments())
            .map(|f| f.data.clone())
    }

    /// Serve `names` verbatim (wire order, pseudo-entries included) for `path`
    pub fn set_raw_listing(&self, path: &str, names: Vec<(&str, EntryKind)>) -> Result<(), VaultError> {
        let path = self.parse(path)?;
        let names = names.into_iter().map(|(n, k)| (n.to_string(), k)).collect();
        lock(&self.state)
            .raw_listings
            .insert(path.segments().to_vec(), names);
        Ok(())
    }

    pub fn set_chunk_size(&self, chunk_size: usize) {
        lock(&self.state).chunk_size = chunk_size.max(1);
    }

    /// Read streams fail with a connection error once `bytes` have been produced
    pub fn fail_reads_after(&self, bytes: Option<usize>) {
        lock(&self.state).fail_reads_after = bytes;
    }

    /// The next sink commit fails with `err` and commits nothing
    pub fn fail_next_commit(&self, err: VaultError) {
        lock(&self.state).fail_commit = Some(err);
    }

    pub fn fail_listing(&self, err: Option<VaultError>) {
        lock(&self.state).fail_listing = err;
    }

    pub fn set_quota(&self, quota: Option<StorageQuota>) {
        lock(&self.state).quota = quota;
    }

    /// Hold reads and listings until [`MemoryAdapter::open_gate`]
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Number of `open_for_read` calls served
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    async fn wait_for_gate(&self) {
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }

    fn children(&self, state: &MemoryState, dir: &[String]) -> Result<Vec<RawChild>, VaultError> {
        if let Some(raw) = state.raw_listings.get(dir) {
            return Ok(raw.iter().map(|(n, k)| (n.clone(), *k, None, None)).collect());
        }
        if !dir.is_empty() && !state.dirs.contains(dir) {
            return Err(VaultError::NotFound(format!("/{}", dir.join("/"))));
        }
        let depth = dir.len();
        let is_child = |key: &Key| key.len() == depth + 1 && key.starts_with(dir);
        let mut out = Vec::new();
        for (key, file) in state.files.iter().filter(|(k, _)| is_child(k)) {
            out.push((
                key[depth].clone(),
                EntryKind::File,
                Some(file.data.len() as u64),
                file.modified_at,
            ));
        }
        for key in state.dirs.iter().filter(|k| is_child(k)) {
            out.push((key[depth].clone(), EntryKind::Directory, None, None));
        }
        Ok(out)
    }
}

fn add_parents(dirs: &mut BTreeSet<Key>, key: &[String]) {
    for end in 1..key.len() {
        dirs.insert(key[..end].to_vec());
    }
}

#[async_trait]
impl BackendAdapter for MemoryAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn display_name(&self) -> String {
        format!("memory:{}", self.id)
    }

    async fn list_directory(&self, path: &RemotePath) -> Result<Vec<Entry>, VaultError> {
        self.wait_for_gate().await;
        let raw = {
            let state = lock(&self.state);
            if let Some(err) = state.fail_listing.clone() {
                if err.is_connection_error() {
                    self.invalidations.fetch_add(1, Ordering::SeqCst);
                }
                return Err(err);
            }
            self.children(&state, path.segments())?
        };
        let parent = RemoteRef::new(self.id.clone(), path.clone());
        let entries = raw.into_iter().filter_map(|(name, kind, size, modified)| {
            // pseudo-entries and separators never get past the boundary
            normalize(&name, self.kind.flavor()).ok()?;
            Entry::child(&parent, &name, kind, size, modified).ok()
        });
        Ok(finalize_listing(entries))
    }

    async fn open_for_read(&self, remote_ref: &RemoteRef) -> Result<ByteStream, VaultError> {
        let (data, chunk_size, fail_after) = {
            let state = lock(&self.state);
            let file = state
                .files
                .get(remote_ref.path.segments())
                .ok_or_else(|| VaultError::NotFound(remote_ref.path.to_wire()))?;
            (file.data.clone(), state.chunk_size, state.fail_reads_after)
        };
        self.reads.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.subscribe();
        let invalidations = self.invalidations.clone();
        let stream = futures_util::stream::try_unfold(
            (data, 0usize, gate),
            move |(data, offset, mut gate)| {
                let invalidations = invalidations.clone();
                async move {
                    let _ = gate.wait_for(|open| *open).await;
                    if let Some(limit) = fail_after {
                        if offset >= limit {
                            invalidations.fetch_add(1, Ordering::SeqCst);
                            return Err(VaultError::ConnectionError(format!(
                                "connection reset after {} bytes",
                                offset
                            )));
                        }
                    }
                    if offset >= data.len() {
                        return Ok(None);
                    }
                    let mut end = (offset + chunk_size).min(data.len());
                    if let Some(limit) = fail_after {
                        end = end.min(limit.max(offset + 1));
                    }
                    let chunk = data.slice(offset..end);
                    Ok(Some((chunk, (data, end, gate))))
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn open_for_write(
        &self,
        path: &RemotePath,
        _expected_size: Option<u64>,
    ) -> Result<Box<dyn ByteSink>, VaultError> {
        if path.is_root() {
            return Err(VaultError::InvalidName("cannot write to the root".to_string()));
        }
        Ok(Box::new(MemorySink {
            state: self.state.clone(),
            key: path.segments().to_vec(),
            buf: BytesMut::new(),
        }))
    }

    async fn stat_entry(&self, remote_ref: &RemoteRef) -> Result<Entry, VaultError> {
        let state = lock(&self.state);
        let key = remote_ref.path.segments();
        if let Some(file) = state.files.get(key) {
            return Entry::at(
                remote_ref.clone(),
                EntryKind::File,
                Some(file.data.len() as u64),
                file.modified_at,
            );
        }
        if state.dirs.contains(key) {
            return Entry::at(remote_ref.clone(), EntryKind::Directory, None, None);
        }
        Err(VaultError::NotFound(remote_ref.path.to_wire()))
    }

    async fn quota(&self) -> Result<Option<StorageQuota>, VaultError> {
        Ok(lock(&self.state).quota)
    }

    fn invalidate_session(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
    key: Key,
    buf: BytesMut,
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), VaultError> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), VaultError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_commit.take() {
            return Err(err);
        }
        add_parents(&mut state.dirs, &self.key);
        state.files.insert(
            self.key.clone(),
            MemoryFile {
                data: self.buf.clone().freeze(),
                modified_at: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

/// Factory handing out pre-registered in-memory adapters by backend id
#[derive(Default)]
pub struct MemoryFactory {
    adapters: Mutex<HashMap<BackendId, Arc<MemoryAdapter>>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<MemoryAdapter>) {
        self.adapters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(adapter.backend_id().clone(), adapter);
    }
}

impl AdapterFactory for MemoryFactory {
    fn create(&self, backend: &Backend) -> Result<Arc<dyn BackendAdapter>, VaultError> {
        let adapters = self
            .adapters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match adapters.get(&backend.id()) {
            Some(adapter) => Ok(adapter.clone()),
            None => Err(VaultError::ConnectionError(format!(
                "no in-memory backend registered for {}",
                backend.id()
            ))),
        }
    }
}
