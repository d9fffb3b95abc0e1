//! SMB Storage Adapter
//!
//! Implementation of the BackendAdapter trait for SMB/CIFS shares on a NAS.
//! The protocol itself sits behind the `SmbConnector`/`SmbSession` seam, which
//! speaks in raw directory records and NTSTATUS codes; this module turns those
//! into entries and the vault error taxonomy.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use super::{
    invalidate_on_connection_error, BackendAdapter, BackendId, BackendKind, ByteSink,
    ByteStream, ConnectionSettings, Entry, EntryKind, RemoteRef, SessionSlot, SmbTarget,
    VaultError,
};
use crate::path_model::{finalize_listing, RemotePath};

/// `FILE_ATTRIBUTE_DIRECTORY`
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;

/// 1601-01-01 to 1970-01-01 in 100 ns ticks
const FILETIME_UNIX_EPOCH: i64 = 116_444_736_000_000_000;
/// Below this a timestamp is taken to be Unix seconds rather than FILETIME ticks
const FILETIME_THRESHOLD: u64 = 10_000_000_000_000;

/// NTSTATUS code returned by an SMB server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const NO_SUCH_FILE: NtStatus = NtStatus(0xC000_000F);
    pub const END_OF_FILE: NtStatus = NtStatus(0xC000_0011);
    pub const ACCESS_DENIED: NtStatus = NtStatus(0xC000_0022);
    pub const OBJECT_NAME_INVALID: NtStatus = NtStatus(0xC000_0033);
    pub const OBJECT_NAME_NOT_FOUND: NtStatus = NtStatus(0xC000_0034);
    pub const OBJECT_NAME_COLLISION: NtStatus = NtStatus(0xC000_0035);
    pub const OBJECT_PATH_NOT_FOUND: NtStatus = NtStatus(0xC000_003A);
    pub const SHARING_VIOLATION: NtStatus = NtStatus(0xC000_0043);
    pub const QUOTA_EXCEEDED: NtStatus = NtStatus(0xC000_0044);
    pub const LOGON_FAILURE: NtStatus = NtStatus(0xC000_006D);
    pub const DISK_FULL: NtStatus = NtStatus(0xC000_007F);
    pub const IO_TIMEOUT: NtStatus = NtStatus(0xC000_00B5);
    pub const UNEXPECTED_NETWORK_ERROR: NtStatus = NtStatus(0xC000_00C4);
    pub const BAD_NETWORK_NAME: NtStatus = NtStatus(0xC000_00CC);
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Failed SMB request
#[derive(Debug, Clone)]
pub struct SmbFailure {
    pub status: NtStatus,
    pub message: String,
}

impl SmbFailure {
    pub fn new(status: NtStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Translate an NTSTATUS failure into the vault taxonomy
pub fn map_status(failure: &SmbFailure) -> VaultError {
    let msg = format!("{} ({})", failure.message, failure.status);
    match failure.status {
        NtStatus::OBJECT_NAME_NOT_FOUND | NtStatus::OBJECT_PATH_NOT_FOUND | NtStatus::NO_SUCH_FILE => {
            VaultError::NotFound(msg)
        }
        NtStatus::ACCESS_DENIED | NtStatus::LOGON_FAILURE | NtStatus::SHARING_VIOLATION => {
            VaultError::PermissionDenied(msg)
        }
        NtStatus::DISK_FULL | NtStatus::QUOTA_EXCEEDED => VaultError::QuotaExceeded(msg),
        NtStatus::OBJECT_NAME_INVALID => VaultError::InvalidName(msg),
        _ => VaultError::ConnectionError(msg),
    }
}

/// One `FILE_DIRECTORY_INFORMATION` record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbDirRecord {
    /// UTF-16LE code units as sent on the wire
    pub file_name: Vec<u16>,
    pub file_attributes: u32,
    pub end_of_file: u64,
    /// FILETIME ticks, 0 when unknown
    pub last_write_time: u64,
}

impl SmbDirRecord {
    pub fn is_directory(&self) -> bool {
        self.file_attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }
}

/// Open file handle for reading
#[async_trait]
pub trait SmbFileReader: Send {
    /// Read up to `len` bytes at `offset`. An empty buffer or
    /// `STATUS_END_OF_FILE` ends the file.
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes, SmbFailure>;
}

/// Open file handle for writing. Nothing is visible at the target path until
/// `commit`.
#[async_trait]
pub trait SmbFileWriter: Send {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SmbFailure>;

    async fn commit(self: Box<Self>) -> Result<(), SmbFailure>;

    async fn discard(self: Box<Self>);
}

/// Authenticated tree connection to one share.
///
/// Paths are share-relative and `\` separated; `""` is the share root.
#[async_trait]
pub trait SmbSession: Send + Sync {
    async fn query_directory(&self, path: &str) -> Result<Vec<SmbDirRecord>, SmbFailure>;

    async fn query_info(&self, path: &str) -> Result<SmbDirRecord, SmbFailure>;

    async fn create_directory(&self, path: &str) -> Result<(), SmbFailure>;

    async fn open_read(&self, path: &str) -> Result<Box<dyn SmbFileReader>, SmbFailure>;

    async fn create_write(&self, path: &str) -> Result<Box<dyn SmbFileWriter>, SmbFailure>;
}

/// Establishes sessions (negotiate, session setup, tree connect)
#[async_trait]
pub trait SmbConnector: Send + Sync {
    async fn connect(&self, target: &SmbTarget) -> Result<Arc<dyn SmbSession>, SmbFailure>;
}

/// Convert a FILETIME (or Unix seconds, for small values) to UTC
pub fn filetime_to_utc(value: u64) -> Option<DateTime<Utc>> {
    if value == 0 {
        return None;
    }
    if value > FILETIME_THRESHOLD {
        let ticks = i64::try_from(value).ok()? - FILETIME_UNIX_EPOCH;
        let secs = ticks.div_euclid(10_000_000);
        let nanos = (ticks.rem_euclid(10_000_000) * 100) as u32;
        DateTime::from_timestamp(secs, nanos)
    } else {
        DateTime::from_timestamp(i64::try_from(value).ok()?, 0)
    }
}

/// Strictly decode a wire name, dropping names that must never reach a listing.
pub fn decode_name(units: &[u16]) -> Option<String> {
    let name = match String::from_utf16(units) {
        Ok(n) => n,
        Err(_) => {
            tracing::warn!("[SMB] Failed to strictly decode file name; skipping entry");
            return None;
        }
    };
    if name == "." || name == ".." || name == "\u{FEFF}" || name.trim().is_empty() {
        return None;
    }
    if name.chars().any(|c| (c as u32) < 0x20) {
        tracing::debug!("[SMB] Skipping name with control characters: {:?}", name);
        return None;
    }
    Some(name)
}

/// SMB Storage Adapter
pub struct SmbAdapter {
    target: SmbTarget,
    id: BackendId,
    connector: Arc<dyn SmbConnector>,
    session: Arc<SessionSlot<dyn SmbSession>>,
    settings: ConnectionSettings,
}

impl SmbAdapter {
    pub fn new(target: SmbTarget, connector: Arc<dyn SmbConnector>, settings: ConnectionSettings) -> Self {
        let id = target.id();
        Self {
            target,
            id,
            connector,
            session: Arc::new(SessionSlot::new()),
            settings,
        }
    }

    async fn session(&self) -> Result<Arc<dyn SmbSession>, VaultError> {
        if let Some(session) = self.session.current() {
            return Ok(session);
        }
        tracing::info!("[SMB] Connecting to {}", self.target.unc_root());
        let session = timeout(self.settings.connect_timeout, self.connector.connect(&self.target))
            .await
            .map_err(|_| {
                VaultError::ConnectionError(format!(
                    "connection to {} timed out",
                    self.target.unc_root()
                ))
            })?
            .map_err(|f| map_status(&f))?;
        self.session.store(session.clone());
        Ok(session)
    }

    /// Run one request under the read/write timeout
    async fn call<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, SmbFailure>>,
    ) -> Result<T, VaultError> {
        with_timeout(self.settings.read_write_timeout, what, fut)
            .await
            .map_err(|e| self.session.check(e))
    }

    fn parent_ref(&self, path: &RemotePath) -> RemoteRef {
        RemoteRef::new(self.id.clone(), path.clone())
    }

    /// Create every missing ancestor of `path`
    async fn ensure_parents(&self, session: &Arc<dyn SmbSession>, path: &RemotePath) -> Result<(), VaultError> {
        let mut current = RemotePath::root(path.flavor());
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        for segment in parent.segments() {
            current = current.join(segment)?;
            let wire = current.to_wire();
            match timeout(self.settings.read_write_timeout, session.create_directory(&wire)).await {
                Ok(Ok(())) => tracing::debug!("[SMB] Created directory {}", wire),
                Ok(Err(f)) if f.status == NtStatus::OBJECT_NAME_COLLISION => {}
                Ok(Err(f)) => return Err(self.session.check(map_status(&f))),
                Err(_) => {
                    return Err(self.session.check(VaultError::ConnectionError(format!(
                        "create directory {} timed out",
                        wire
                    ))))
                }
            }
        }
        Ok(())
    }
}

async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, SmbFailure>>,
) -> Result<T, VaultError> {
    match timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(f)) => Err(map_status(&f)),
        Err(_) => Err(VaultError::ConnectionError(format!(
            "{} timed out after {:?}",
            what, limit
        ))),
    }
}

#[async_trait]
impl BackendAdapter for SmbAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Smb
    }

    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn display_name(&self) -> String {
        match self.target.credentials.username() {
            Some(user) => format!("{}@{}", user, self.target.unc_root()),
            None => self.target.unc_root(),
        }
    }

    async fn list_directory(&self, path: &RemotePath) -> Result<Vec<Entry>, VaultError> {
        let session = self.session().await?;
        let wire = path.to_wire();
        tracing::debug!("[SMB] Listing {}\\{}", self.target.unc_root(), wire);

        let records = self.call("query directory", session.query_directory(&wire)).await?;
        let parent = self.parent_ref(path);
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let Some(name) = decode_name(&record.file_name) else {
                continue;
            };
            let kind = if record.is_directory() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            match Entry::child(
                &parent,
                &name,
                kind,
                Some(record.end_of_file),
                filetime_to_utc(record.last_write_time),
            ) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("[SMB] Skipping entry {:?}: {}", name, e),
            }
        }
        let entries = finalize_listing(entries);
        tracing::debug!("[SMB] Parsed {} entries", entries.len());
        Ok(entries)
    }

    async fn open_for_read(&self, remote_ref: &RemoteRef) -> Result<ByteStream, VaultError> {
        let session = self.session().await?;
        let wire = remote_ref.path.to_wire();
        tracing::debug!("[SMB] Opening {} for read", wire);
        let reader = self.call("open", session.open_read(&wire)).await?;

        let chunk_size = self.settings.chunk_size;
        let limit = self.settings.read_write_timeout;
        let stream = futures_util::stream::try_unfold((reader, 0u64), move |(mut reader, offset)| async move {
            match timeout(limit, reader.read_at(offset, chunk_size)).await {
                Err(_) => Err(VaultError::ConnectionError(format!(
                    "read at offset {} timed out after {:?}",
                    offset, limit
                ))),
                Ok(Err(f)) if f.status == NtStatus::END_OF_FILE => Ok(None),
                Ok(Err(f)) => Err(map_status(&f)),
                Ok(Ok(data)) if data.is_empty() => Ok(None),
                Ok(Ok(data)) => {
                    let next = offset + data.len() as u64;
                    Ok(Some((data, (reader, next))))
                }
            }
        });
        Ok(invalidate_on_connection_error(Box::pin(stream), self.session.clone()))
    }

    async fn open_for_write(
        &self,
        path: &RemotePath,
        expected_size: Option<u64>,
    ) -> Result<Box<dyn ByteSink>, VaultError> {
        if path.is_root() {
            return Err(VaultError::InvalidName("cannot write to the share root".to_string()));
        }
        let session = self.session().await?;
        self.ensure_parents(&session, path).await?;

        let wire = path.to_wire();
        tracing::debug!("[SMB] Creating {} ({:?} bytes)", wire, expected_size);
        let writer = self.call("create", session.create_write(&wire)).await?;
        Ok(Box::new(SmbSink {
            writer,
            offset: 0,
            limit: self.settings.read_write_timeout,
            slot: self.session.clone(),
        }))
    }

    async fn stat_entry(&self, remote_ref: &RemoteRef) -> Result<Entry, VaultError> {
        let session = self.session().await?;
        let wire = remote_ref.path.to_wire();
        let record = self.call("query info", session.query_info(&wire)).await?;
        let kind = if record.is_directory() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Entry::at(
            remote_ref.clone(),
            kind,
            Some(record.end_of_file),
            filetime_to_utc(record.last_write_time),
        )
    }

    fn invalidate_session(&self) {
        tracing::debug!("[SMB] Dropping session for {}", self.target.unc_root());
        self.session.invalidate();
    }
}

/// ByteSink over an open SMB write handle
struct SmbSink {
    writer: Box<dyn SmbFileWriter>,
    offset: u64,
    limit: Duration,
    slot: Arc<SessionSlot<dyn SmbSession>>,
}

#[async_trait]
impl ByteSink for SmbSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), VaultError> {
        with_timeout(self.limit, "write", self.writer.write_at(self.offset, &chunk))
            .await
            .map_err(|e| self.slot.check(e))?;
        self.offset += chunk.len() as u64;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), VaultError> {
        let this = *self;
        with_timeout(this.limit, "commit", this.writer.commit())
            .await
            .map_err(|e| this.slot.check(e))
    }

    async fn abort(self: Box<Self>) {
        self.writer.discard().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_model::PathFlavor;
    use crate::providers::Credentials;
    use futures_util::TryStreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn record(name: &str, dir: bool, size: u64) -> SmbDirRecord {
        SmbDirRecord {
            file_name: utf16(name),
            file_attributes: if dir { FILE_ATTRIBUTE_DIRECTORY } else { 0x20 },
            end_of_file: size,
            last_write_time: 133_000_000_000_000_000,
        }
    }

    struct ScriptedReader {
        data: Vec<u8>,
        eof_as_error: bool,
    }

    #[async_trait]
    impl SmbFileReader for ScriptedReader {
        async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes, SmbFailure> {
            let start = offset as usize;
            if start >= self.data.len() {
                if self.eof_as_error {
                    return Err(SmbFailure::new(NtStatus::END_OF_FILE, "end of file"));
                }
                return Ok(Bytes::new());
            }
            let end = (start + len).min(self.data.len());
            Ok(Bytes::copy_from_slice(&self.data[start..end]))
        }
    }

    struct ScriptedSession {
        records: Vec<SmbDirRecord>,
        fail_with: Mutex<Option<NtStatus>>,
    }

    #[async_trait]
    impl SmbSession for ScriptedSession {
        async fn query_directory(&self, _path: &str) -> Result<Vec<SmbDirRecord>, SmbFailure> {
            if let Some(status) = *self.fail_with.lock().unwrap() {
                return Err(SmbFailure::new(status, "scripted"));
            }
            Ok(self.records.clone())
        }

        async fn query_info(&self, path: &str) -> Result<SmbDirRecord, SmbFailure> {
            let name = path.rsplit('\\').next().unwrap_or(path);
            self.records
                .iter()
                .find(|r| r.file_name == utf16(name))
                .cloned()
                .ok_or_else(|| SmbFailure::new(NtStatus::OBJECT_NAME_NOT_FOUND, path))
        }

        async fn create_directory(&self, _path: &str) -> Result<(), SmbFailure> {
            Ok(())
        }

        async fn open_read(&self, _path: &str) -> Result<Box<dyn SmbFileReader>, SmbFailure> {
            Ok(Box::new(ScriptedReader {
                data: (0..=255u8).cycle().take(2500).collect(),
                eof_as_error: true,
            }))
        }

        async fn create_write(&self, path: &str) -> Result<Box<dyn SmbFileWriter>, SmbFailure> {
            Err(SmbFailure::new(NtStatus::DISK_FULL, path))
        }
    }

    struct CountingConnector {
        session: Arc<ScriptedSession>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl SmbConnector for CountingConnector {
        async fn connect(&self, _target: &SmbTarget) -> Result<Arc<dyn SmbSession>, SmbFailure> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.session.clone())
        }
    }

    fn adapter(records: Vec<SmbDirRecord>) -> (SmbAdapter, Arc<CountingConnector>) {
        let connector = Arc::new(CountingConnector {
            session: Arc::new(ScriptedSession {
                records,
                fail_with: Mutex::new(None),
            }),
            connects: AtomicUsize::new(0),
        });
        let target = SmbTarget {
            host: "nas".to_string(),
            share: "media".to_string(),
            credentials: Credentials::Anonymous,
            mount_point: None,
        };
        let settings = ConnectionSettings {
            chunk_size: 1000,
            ..ConnectionSettings::default()
        };
        (SmbAdapter::new(target, connector.clone(), settings), connector)
    }

    #[test]
    fn test_filetime_conversion() {
        // 2024-01-01T00:00:00Z
        let ft = 133_485_408_000_000_000u64;
        assert_eq!(filetime_to_utc(ft).unwrap().timestamp(), 1_704_067_200);
        assert_eq!(filetime_to_utc(1_704_067_200).unwrap().timestamp(), 1_704_067_200);
        assert!(filetime_to_utc(0).is_none());
    }

    #[test]
    fn test_decode_name_filters_wire_noise() {
        assert_eq!(decode_name(&utf16("clip.mp4")).as_deref(), Some("clip.mp4"));
        assert!(decode_name(&utf16(".")).is_none());
        assert!(decode_name(&utf16("..")).is_none());
        assert!(decode_name(&utf16("\u{FEFF}")).is_none());
        assert!(decode_name(&utf16("   ")).is_none());
        assert!(decode_name(&utf16("bad\u{7}name")).is_none());
        // unpaired surrogate
        assert!(decode_name(&[0xD800, 0x0041]).is_none());
    }

    #[test]
    fn test_status_mapping() {
        let kind = |s| map_status(&SmbFailure::new(s, "x")).kind();
        use crate::providers::ErrorKind;
        assert_eq!(kind(NtStatus::OBJECT_NAME_NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(kind(NtStatus::OBJECT_PATH_NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(kind(NtStatus::LOGON_FAILURE), ErrorKind::PermissionDenied);
        assert_eq!(kind(NtStatus::SHARING_VIOLATION), ErrorKind::PermissionDenied);
        assert_eq!(kind(NtStatus::DISK_FULL), ErrorKind::QuotaExceeded);
        assert_eq!(kind(NtStatus::OBJECT_NAME_INVALID), ErrorKind::InvalidName);
        assert_eq!(kind(NtStatus::IO_TIMEOUT), ErrorKind::ConnectionError);
        assert_eq!(kind(NtStatus(0xC000_0120)), ErrorKind::ConnectionError);
    }

    #[tokio::test]
    async fn test_listing_scenario() {
        let (adapter, _) = adapter(vec![
            record("b.jpg", false, 10),
            record("A", true, 4096),
            record("a.jpg", false, 20),
            record(".", true, 0),
            record("..", true, 0),
        ]);
        let listing = adapter
            .list_directory(&RemotePath::root(PathFlavor::Smb))
            .await
            .unwrap();
        let names: Vec<&str> = listing.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["A", "a.jpg", "b.jpg"]);
        assert_eq!(listing[0].size(), None);
        assert_eq!(listing[1].size(), Some(20));
        assert!(listing[1].modified_at().is_some());
    }

    #[tokio::test]
    async fn test_read_stream_treats_end_of_file_status_as_eof() {
        let (adapter, _) = adapter(vec![record("clip.mp4", false, 2500)]);
        let r = RemoteRef::new(
            adapter.backend_id().clone(),
            RemotePath::parse(PathFlavor::Smb, "clip.mp4").unwrap(),
        );
        let chunks: Vec<Bytes> = adapter.open_for_read(&r).await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 2500);
    }

    #[tokio::test]
    async fn test_connection_error_forces_reconnect() {
        let (adapter, connector) = adapter(vec![record("x", false, 1)]);
        let root = RemotePath::root(PathFlavor::Smb);
        adapter.list_directory(&root).await.unwrap();
        adapter.list_directory(&root).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        *connector.session.fail_with.lock().unwrap() = Some(NtStatus::UNEXPECTED_NETWORK_ERROR);
        let err = adapter.list_directory(&root).await.unwrap_err();
        assert!(err.is_connection_error());

        *connector.session.fail_with.lock().unwrap() = None;
        adapter.list_directory(&root).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_keeps_session() {
        let (adapter, connector) = adapter(vec![]);
        let r = RemoteRef::new(
            adapter.backend_id().clone(),
            RemotePath::parse(PathFlavor::Smb, "gone.jpg").unwrap(),
        );
        let err = adapter.stat_entry(&r).await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
        adapter.stat_entry(&r).await.unwrap_err();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disk_full_surfaces_as_quota() {
        let (adapter, _) = adapter(vec![]);
        let path = RemotePath::parse(PathFlavor::Smb, "big.mov").unwrap();
        let err = adapter.open_for_write(&path, Some(10)).await.err().unwrap();
        assert!(matches!(err, VaultError::QuotaExceeded(_)));
    }
}
