//! Shared types for backend adapters
//!
//! This module contains the types shared by the SMB and WebDAV adapters:
//! backend targets and credentials, remote references, directory entries,
//! connection settings and the error taxonomy.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::path_model::{self, PathFlavor, RemotePath};

/// Supported backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SMB/CIFS share on a local NAS
    Smb,
    /// Self-hosted Nextcloud/ownCloud over WebDAV
    Cloud,
}

impl BackendKind {
    pub fn flavor(&self) -> PathFlavor {
        match self {
            BackendKind::Smb => PathFlavor::Smb,
            BackendKind::Cloud => PathFlavor::Cloud,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Smb => write!(f, "SMB"),
            BackendKind::Cloud => write!(f, "Cloud"),
        }
    }
}

/// Stable identity of a configured backend.
///
/// Used to qualify remote references and cache keys, so it must not change
/// between runs for the same target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle for re-requesting a remote object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub backend: BackendId,
    pub path: RemotePath,
}

impl RemoteRef {
    pub fn new(backend: BackendId, path: RemotePath) -> Self {
        Self { backend, path }
    }

    /// Backend-qualified key, stable across runs
    pub fn cache_key(&self) -> String {
        format!("{}#{}", self.backend, self.path)
    }

    pub fn name(&self) -> Option<&str> {
        self.path.name()
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One file or directory returned by a listing.
///
/// Entries can only be built through [`Entry::child`] or [`Entry::at`], both
/// of which validate the name, so a `.`/`..` entry cannot exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    name: String,
    kind: EntryKind,
    size: Option<u64>,
    modified_at: Option<DateTime<Utc>>,
    remote_ref: RemoteRef,
}

impl Entry {
    /// Build an entry for `raw_name` inside the directory `parent`.
    pub fn child(
        parent: &RemoteRef,
        raw_name: &str,
        kind: EntryKind,
        size: Option<u64>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<Self, VaultError> {
        let path = path_model::join_path(&parent.path, raw_name)?;
        Self::at(RemoteRef::new(parent.backend.clone(), path), kind, size, modified_at)
    }

    /// Build an entry describing `remote_ref` itself (stat results).
    pub fn at(
        remote_ref: RemoteRef,
        kind: EntryKind,
        size: Option<u64>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<Self, VaultError> {
        let name = remote_ref
            .path
            .name()
            .ok_or_else(|| VaultError::InvalidName("backend root has no entry".to_string()))?;
        let name = path_model::normalize(name, remote_ref.path.flavor())?;
        Ok(Self {
            name,
            kind,
            size: match kind {
                EntryKind::File => size,
                EntryKind::Directory => None,
            },
            modified_at,
            remote_ref,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Size in bytes; `None` for directories and when the backend did not say
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    pub fn remote_ref(&self) -> &RemoteRef {
        &self.remote_ref
    }

    /// File extension, lowercased (used for cache file naming)
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }
}

pub(crate) fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Authentication material for a backend
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Username/password (NTLM for SMB, HTTP basic for WebDAV)
    Password {
        username: String,
        password: SecretString,
    },
    /// App token sent as a bearer token
    Token {
        username: String,
        token: SecretString,
    },
    Anonymous,
}

impl Credentials {
    pub fn username(&self) -> Option<&str> {
        match self {
            Credentials::Password { username, .. } | Credentials::Token { username, .. } => {
                Some(username)
            }
            Credentials::Anonymous => None,
        }
    }
}

/// SMB share on a NAS
#[derive(Debug, Clone)]
pub struct SmbTarget {
    pub host: String,
    pub share: String,
    pub credentials: Credentials,
    /// Where the share is mounted locally, when it is not reachable as a UNC path
    pub mount_point: Option<PathBuf>,
}

impl SmbTarget {
    pub fn id(&self) -> BackendId {
        BackendId::new(format!(
            "smb://{}/{}",
            self.host.to_ascii_lowercase(),
            self.share.trim_matches(|c| c == '/' || c == '\\')
        ))
    }

    /// `\\host\share`
    pub fn unc_root(&self) -> String {
        format!(
            r"\\{}\{}",
            self.host,
            self.share.trim_matches(|c| c == '/' || c == '\\')
        )
    }
}

/// Nextcloud/ownCloud WebDAV endpoint
#[derive(Debug, Clone)]
pub struct CloudTarget {
    base_url: String,
    pub credentials: Credentials,
}

impl CloudTarget {
    /// Normalize `base_url` to the per-user DAV root.
    ///
    /// A trailing slash is always present; URLs that do not already point at
    /// `/remote.php/dav/files/` get `remote.php/dav/files/<username>/`
    /// appended.
    pub fn new(base_url: &str, credentials: Credentials) -> Self {
        let mut url = base_url.trim().to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        if !url.contains("/remote.php/dav/files/") {
            if let Some(username) = credentials.username() {
                url = format!(
                    "{}/remote.php/dav/files/{}/",
                    url.trim_end_matches('/'),
                    urlencoding::encode(username)
                );
            }
        }
        Self {
            base_url: url,
            credentials,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn id(&self) -> BackendId {
        BackendId::new(self.base_url.clone())
    }
}

/// A configured connection target
#[derive(Debug, Clone)]
pub enum Backend {
    Smb(SmbTarget),
    Cloud(CloudTarget),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Smb(_) => BackendKind::Smb,
            Backend::Cloud(_) => BackendKind::Cloud,
        }
    }

    pub fn id(&self) -> BackendId {
        match self {
            Backend::Smb(t) => t.id(),
            Backend::Cloud(t) => t.id(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Backend::Smb(t) => match t.credentials.username() {
                Some(user) => format!("{}@{}", user, t.unc_root()),
                None => t.unc_root(),
            },
            Backend::Cloud(t) => {
                let host = url::Url::parse(t.base_url())
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| t.base_url().to_string());
                match t.credentials.username() {
                    Some(user) => format!("{}@{}", user, host),
                    None => host,
                }
            }
        }
    }

    pub fn summary(&self) -> BackendSummary {
        BackendSummary {
            id: self.id(),
            kind: self.kind(),
            display_name: self.display_name(),
        }
    }
}

/// Serializable description of a backend (no credentials)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSummary {
    pub id: BackendId,
    pub kind: BackendKind,
    pub display_name: String,
}

/// Storage used and left on a backend account. Servers that report an
/// unlimited quota leave `free` and `total` empty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageQuota {
    pub used: u64,
    pub free: Option<u64>,
    pub total: Option<u64>,
}

impl StorageQuota {
    /// Whether `bytes` more can be stored
    pub fn fits(&self, bytes: u64) -> bool {
        self.free.map_or(true, |free| bytes <= free)
    }
}

/// Per-connection limits applied by every adapter
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    /// Applies to each single read or write
    pub read_write_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_write_timeout: Duration::from_secs(30),
            chunk_size: 1024 * 1024,
        }
    }
}

/// Error kind as reported to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidName,
    NotFound,
    PermissionDenied,
    ConnectionError,
    QuotaExceeded,
    CacheCorruption,
    Superseded,
    NoActiveBackend,
    InvalidConfig,
    UnknownJob,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidName => "invalid_name",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::CacheCorruption => "cache_corruption",
            ErrorKind::Superseded => "superseded",
            ErrorKind::NoActiveBackend => "no_active_backend",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::UnknownJob => "unknown_job",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

/// Vault error type
///
/// Adapters translate SMB status codes and HTTP statuses into the first five
/// variants; they travel unchanged into a failed job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    #[error("Listing superseded by a backend switch")]
    Superseded,

    #[error("No active backend")]
    NoActiveBackend,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown transfer job: {0}")]
    UnknownJob(u64),

    #[error("Local I/O error: {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::InvalidName(_) => ErrorKind::InvalidName,
            VaultError::NotFound(_) => ErrorKind::NotFound,
            VaultError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            VaultError::ConnectionError(_) => ErrorKind::ConnectionError,
            VaultError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            VaultError::CacheCorruption(_) => ErrorKind::CacheCorruption,
            VaultError::Superseded => ErrorKind::Superseded,
            VaultError::NoActiveBackend => ErrorKind::NoActiveBackend,
            VaultError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            VaultError::UnknownJob(_) => ErrorKind::UnknownJob,
            VaultError::Io { .. } => ErrorKind::Io,
        }
    }

    /// Connection errors invalidate the adapter session
    pub fn is_connection_error(&self) -> bool {
        matches!(self, VaultError::ConnectionError(_))
    }
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        VaultError::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password(user: &str) -> Credentials {
        Credentials::Password {
            username: user.to_string(),
            password: SecretString::from("secret".to_string()),
        }
    }

    #[test]
    fn test_cloud_target_appends_dav_root() {
        let t = CloudTarget::new("https://cloud.example.com", password("alice"));
        assert_eq!(
            t.base_url(),
            "https://cloud.example.com/remote.php/dav/files/alice/"
        );

        let t = CloudTarget::new(
            "https://cloud.example.com/remote.php/dav/files/bob",
            password("alice"),
        );
        assert_eq!(
            t.base_url(),
            "https://cloud.example.com/remote.php/dav/files/bob/"
        );
    }

    #[test]
    fn test_smb_target_identity_is_stable() {
        let t = SmbTarget {
            host: "NAS.local".to_string(),
            share: "/media/".to_string(),
            credentials: Credentials::Anonymous,
            mount_point: None,
        };
        assert_eq!(t.id().as_str(), "smb://nas.local/media");
        assert_eq!(t.unc_root(), r"\\NAS.local\media");
    }

    #[test]
    fn test_entry_rejects_pseudo_names() {
        let parent = RemoteRef::new(BackendId::new("x"), RemotePath::root(PathFlavor::Smb));
        assert!(Entry::child(&parent, "..", EntryKind::Directory, None, None).is_err());
        let dir = Entry::child(&parent, "Clips", EntryKind::Directory, Some(42), None).unwrap();
        assert_eq!(dir.size(), None);
        assert_eq!(dir.remote_ref().path.to_wire(), "Clips");
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("IMG_0001.JPG"), Some("jpg".to_string()));
        assert_eq!(extension_of(".hidden"), None);
        assert_eq!(extension_of("Makefile"), None);
        assert_eq!(extension_of("weird.e x"), None);
    }

    #[test]
    fn test_io_error_keeps_kind() {
        let e: VaultError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(e.kind(), ErrorKind::Io);
        assert!(!e.is_connection_error());
    }
}
