//! SMB session over the operating system's share mount
//!
//! The OS redirector (Windows UNC access, `mount -t cifs`, macOS `mount_smbfs`)
//! already negotiates and authenticates; this session only walks the mounted
//! tree with `tokio::fs` and reports failures as NTSTATUS codes so the SMB
//! adapter sees the same vocabulary as from a wire client.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::smb::{
    NtStatus, SmbConnector, SmbDirRecord, SmbFailure, SmbFileReader, SmbFileWriter, SmbSession,
    FILE_ATTRIBUTE_DIRECTORY,
};
use super::SmbTarget;

const FILE_ATTRIBUTE_NORMAL: u32 = 0x80;
const TEMP_SUFFIX: &str = ".sigvault-part";

#[cfg(unix)]
const DISK_FULL_CODES: &[i32] = &[28, 122];
#[cfg(windows)]
const DISK_FULL_CODES: &[i32] = &[39, 112];
#[cfg(not(any(unix, windows)))]
const DISK_FULL_CODES: &[i32] = &[];

fn io_failure(e: std::io::Error, context: &str) -> SmbFailure {
    use std::io::ErrorKind;
    let status = match e.kind() {
        ErrorKind::NotFound => NtStatus::OBJECT_NAME_NOT_FOUND,
        ErrorKind::PermissionDenied => NtStatus::ACCESS_DENIED,
        ErrorKind::AlreadyExists => NtStatus::OBJECT_NAME_COLLISION,
        ErrorKind::InvalidInput => NtStatus::OBJECT_NAME_INVALID,
        ErrorKind::TimedOut => NtStatus::IO_TIMEOUT,
        _ => match e.raw_os_error() {
            Some(code) if DISK_FULL_CODES.contains(&code) => NtStatus::DISK_FULL,
            _ => NtStatus::UNEXPECTED_NETWORK_ERROR,
        },
    };
    SmbFailure::new(status, format!("{}: {}", context, e))
}

fn to_filetime(time: SystemTime) -> u64 {
    let ticks = match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_nanos() / 100,
        Err(_) => return 0,
    };
    u64::try_from(ticks).map_or(0, |t| t + 116_444_736_000_000_000)
}

fn record_for(name: &str, meta: &std::fs::Metadata) -> SmbDirRecord {
    SmbDirRecord {
        file_name: name.encode_utf16().collect(),
        file_attributes: if meta.is_dir() {
            FILE_ATTRIBUTE_DIRECTORY
        } else {
            FILE_ATTRIBUTE_NORMAL
        },
        end_of_file: if meta.is_dir() { 0 } else { meta.len() },
        last_write_time: meta.modified().map(to_filetime).unwrap_or(0),
    }
}

/// Connector that resolves a target to its locally mounted directory
#[derive(Debug, Default)]
pub struct MountedShareConnector;

impl MountedShareConnector {
    pub fn new() -> Self {
        Self
    }

    fn share_root(target: &SmbTarget) -> Result<PathBuf, SmbFailure> {
        if let Some(mount) = &target.mount_point {
            return Ok(mount.clone());
        }
        if cfg!(windows) {
            return Ok(PathBuf::from(target.unc_root()));
        }
        Err(SmbFailure::new(
            NtStatus::BAD_NETWORK_NAME,
            format!("{} is not mounted; set local.mount_point", target.unc_root()),
        ))
    }
}

#[async_trait]
impl SmbConnector for MountedShareConnector {
    async fn connect(&self, target: &SmbTarget) -> Result<Arc<dyn SmbSession>, SmbFailure> {
        let root = Self::share_root(target)?;
        let meta = tokio::fs::metadata(&root).await.map_err(|e| {
            let mut failure = io_failure(e, &root.display().to_string());
            if failure.status == NtStatus::OBJECT_NAME_NOT_FOUND {
                failure.status = NtStatus::BAD_NETWORK_NAME;
            }
            failure
        })?;
        if !meta.is_dir() {
            return Err(SmbFailure::new(
                NtStatus::BAD_NETWORK_NAME,
                format!("{} is not a directory", root.display()),
            ));
        }
        tracing::debug!("[SMB] Share {} resolved to {}", target.unc_root(), root.display());
        Ok(Arc::new(MountedShareSession { root }))
    }
}

/// Session rooted at a mounted share directory
pub struct MountedShareSession {
    root: PathBuf,
}

impl MountedShareSession {
    fn resolve(&self, path: &str) -> PathBuf {
        path.split('\\')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |acc, seg| acc.join(seg))
    }
}

#[async_trait]
impl SmbSession for MountedShareSession {
    async fn query_directory(&self, path: &str) -> Result<Vec<SmbDirRecord>, SmbFailure> {
        let dir = self.resolve(path);
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_failure(e, path))?;
        let mut records = Vec::new();
        while let Some(item) = rd.next_entry().await.map_err(|e| io_failure(e, path))? {
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                tracing::warn!("[SMB] Skipping non-Unicode name in {}", dir.display());
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            match item.metadata().await {
                Ok(meta) => records.push(record_for(&name, &meta)),
                Err(e) => tracing::debug!("[SMB] No metadata for {}: {}", name, e),
            }
        }
        Ok(records)
    }

    async fn query_info(&self, path: &str) -> Result<SmbDirRecord, SmbFailure> {
        let full = self.resolve(path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| io_failure(e, path))?;
        let name = path.rsplit('\\').next().unwrap_or_default();
        Ok(record_for(name, &meta))
    }

    async fn create_directory(&self, path: &str) -> Result<(), SmbFailure> {
        tokio::fs::create_dir(self.resolve(path))
            .await
            .map_err(|e| io_failure(e, path))
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn SmbFileReader>, SmbFailure> {
        let full = self.resolve(path);
        let file = File::open(&full).await.map_err(|e| io_failure(e, path))?;
        let meta = file.metadata().await.map_err(|e| io_failure(e, path))?;
        if meta.is_dir() {
            return Err(SmbFailure::new(
                NtStatus::OBJECT_NAME_INVALID,
                format!("{} is a directory", path),
            ));
        }
        Ok(Box::new(MountedReader { file }))
    }

    async fn create_write(&self, path: &str) -> Result<Box<dyn SmbFileWriter>, SmbFailure> {
        let target = self.resolve(path);
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| SmbFailure::new(NtStatus::OBJECT_NAME_INVALID, path))?;
        let temp = target.with_file_name(format!(
            ".{}.{}{}",
            name,
            uuid::Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));
        let file = File::create(&temp).await.map_err(|e| io_failure(e, path))?;
        Ok(Box::new(MountedWriter {
            file: Some(file),
            temp,
            target,
        }))
    }
}

struct MountedReader {
    file: File,
}

#[async_trait]
impl SmbFileReader for MountedReader {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes, SmbFailure> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_failure(e, "seek"))?;
        let mut buf = vec![0u8; len];
        let n = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| io_failure(e, "read"))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

/// Writes into a hidden sibling and renames it over the target on commit
struct MountedWriter {
    file: Option<File>,
    temp: PathBuf,
    target: PathBuf,
}

impl MountedWriter {
    fn file(&mut self) -> Result<&mut File, SmbFailure> {
        self.file
            .as_mut()
            .ok_or_else(|| SmbFailure::new(NtStatus::UNEXPECTED_NETWORK_ERROR, "handle closed"))
    }
}

#[async_trait]
impl SmbFileWriter for MountedWriter {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SmbFailure> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_failure(e, "seek"))?;
        file.write_all(data).await.map_err(|e| io_failure(e, "write"))
    }

    async fn commit(self: Box<Self>) -> Result<(), SmbFailure> {
        let mut this = self;
        let mut file = this
            .file
            .take()
            .ok_or_else(|| SmbFailure::new(NtStatus::UNEXPECTED_NETWORK_ERROR, "handle closed"))?;
        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = synced {
            remove_quietly(&this.temp).await;
            return Err(io_failure(e, "flush"));
        }
        if let Err(e) = tokio::fs::rename(&this.temp, &this.target).await {
            remove_quietly(&this.temp).await;
            return Err(io_failure(e, "rename"));
        }
        Ok(())
    }

    async fn discard(self: Box<Self>) {
        let mut this = self;
        this.file.take();
        remove_quietly(&this.temp).await;
    }
}

impl Drop for MountedWriter {
    fn drop(&mut self) {
        // Dropped mid-write without commit or discard
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("[SMB] Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_model::{PathFlavor, RemotePath};
    use crate::providers::{
        BackendAdapter, ConnectionSettings, Credentials, ErrorKind, RemoteRef, SmbAdapter,
    };
    use futures_util::TryStreamExt;

    fn mounted(dir: &Path) -> SmbAdapter {
        let target = SmbTarget {
            host: "nas".to_string(),
            share: "media".to_string(),
            credentials: Credentials::Anonymous,
            mount_point: Some(dir.to_path_buf()),
        };
        SmbAdapter::new(
            target,
            Arc::new(MountedShareConnector::new()),
            ConnectionSettings {
                chunk_size: 4096,
                ..ConnectionSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_listing_mounted_share() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Trips")).unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"bbbb").unwrap();
        std::fs::write(dir.path().join("a.JPG"), b"aa").unwrap();

        let adapter = mounted(dir.path());
        let listing = adapter
            .list_directory(&RemotePath::root(PathFlavor::Smb))
            .await
            .unwrap();
        let names: Vec<&str> = listing.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["Trips", "a.JPG", "b.jpg"]);
        assert_eq!(listing[2].size(), Some(4));
        assert!(listing[2].modified_at().is_some());
    }

    #[tokio::test]
    async fn test_write_commits_atomically_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = mounted(dir.path());
        let path = RemotePath::parse(PathFlavor::Smb, r"2024\summer\clip.bin").unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut sink = adapter.open_for_write(&path, Some(payload.len() as u64)).await.unwrap();
        for chunk in payload.chunks(3000) {
            sink.write(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        let final_path = dir.path().join("2024").join("summer").join("clip.bin");
        assert!(!final_path.exists());
        sink.commit().await.unwrap();
        assert!(final_path.exists());

        let r = RemoteRef::new(adapter.backend_id().clone(), path);
        let chunks: Vec<Bytes> = adapter.open_for_read(&r).await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), payload);
    }

    #[tokio::test]
    async fn test_aborted_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = mounted(dir.path());
        let path = RemotePath::parse(PathFlavor::Smb, "partial.bin").unwrap();

        let mut sink = adapter.open_for_write(&path, None).await.unwrap();
        sink.write(Bytes::from_static(b"half")).await.unwrap();
        sink.abort().await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = mounted(dir.path());
        let r = RemoteRef::new(
            adapter.backend_id().clone(),
            RemotePath::parse(PathFlavor::Smb, "nope.jpg").unwrap(),
        );
        let err = adapter.stat_entry(&r).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unmounted_share_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = mounted(&dir.path().join("not-there"));
        let err = adapter
            .list_directory(&RemotePath::root(PathFlavor::Smb))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
    }
}
