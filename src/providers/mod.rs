//! Backend Adapters
//!
//! This module provides the abstraction layer over the two storage backends a
//! vault can be pointed at. Both implement the `BackendAdapter` trait, so the
//! transfer engine and the coordinator never branch on backend type.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            BackendAdapter Trait             │
//! │  list_directory, open_for_read/write, stat  │
//! └─────────────────────────────────────────────┘
//!                      │
//!          ┌───────────┼────────────┐
//!          ▼           ▼            ▼
//!      ┌───────┐  ┌─────────┐  ┌────────┐
//!      │  SMB  │  │ WebDAV  │  │ Memory │
//!      └───────┘  └─────────┘  └────────┘
//! ```

pub mod types;
pub mod smb;
pub mod smb_mount;
pub mod webdav;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use types::*;
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryAdapter, MemoryFactory};
pub use smb::SmbAdapter;
pub use smb_mount::MountedShareConnector;
pub use webdav::{ServerCapabilities, ServerVersion, WebDavAdapter};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::path_model::RemotePath;

/// Lazily produced, finite byte sequence. Dropping it releases the
/// underlying handle or socket.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, VaultError>> + Send>>;

/// Destination for uploaded bytes.
///
/// Nothing becomes visible on the backend until `commit` succeeds; `abort`
/// (or dropping the sink) discards whatever was written.
#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<(), VaultError>;

    /// Durably commit the written bytes
    async fn commit(self: Box<Self>) -> Result<(), VaultError>;

    /// Discard the written bytes
    async fn abort(self: Box<Self>);
}

/// Capability set shared by every backend
///
/// Errors are already translated into the [`VaultError`] taxonomy. A
/// `ConnectionError` from any operation drops the adapter's session so the
/// next call reconnects; adapters never retry on their own.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn backend_id(&self) -> &BackendId;

    fn display_name(&self) -> String;

    fn root(&self) -> RemotePath {
        RemotePath::root(self.kind().flavor())
    }

    /// List a directory: no pseudo-entries, no duplicate names, directories
    /// first then case-insensitive name order.
    async fn list_directory(&self, path: &RemotePath) -> Result<Vec<Entry>, VaultError>;

    async fn open_for_read(&self, remote_ref: &RemoteRef) -> Result<ByteStream, VaultError>;

    async fn open_for_write(
        &self,
        path: &RemotePath,
        expected_size: Option<u64>,
    ) -> Result<Box<dyn ByteSink>, VaultError>;

    async fn stat_entry(&self, remote_ref: &RemoteRef) -> Result<Entry, VaultError>;

    /// Account quota, for backends that report one
    async fn quota(&self) -> Result<Option<StorageQuota>, VaultError> {
        Ok(None)
    }

    /// Drop the current session; the next call connects afresh
    fn invalidate_session(&self);
}

/// Holder for an adapter's current session.
///
/// Cloned into read streams so a connection error seen mid-stream can still
/// invalidate the session after the adapter call has returned.
pub struct SessionSlot<S: ?Sized> {
    inner: Mutex<Option<Arc<S>>>,
}

impl<S: ?Sized> SessionSlot<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<S>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn store(&self, session: Arc<S>) {
        *self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);
    }

    pub fn invalidate(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    /// Invalidate when `err` is a connection error, then hand it back
    pub fn check(&self, err: VaultError) -> VaultError {
        if err.is_connection_error() {
            self.invalidate();
        }
        err
    }
}

impl<S: ?Sized> Default for SessionSlot<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a read stream so a mid-stream connection error drops `slot`.
pub fn invalidate_on_connection_error<S>(stream: ByteStream, slot: Arc<SessionSlot<S>>) -> ByteStream
where
    S: ?Sized + Send + Sync + 'static,
{
    Box::pin(stream.inspect_err(move |e| {
        if e.is_connection_error() {
            slot.invalidate();
        }
    }))
}

/// Builds adapters for configured backends
pub trait AdapterFactory: Send + Sync {
    fn create(&self, backend: &Backend) -> Result<Arc<dyn BackendAdapter>, VaultError>;
}

/// Production factory: SMB over the OS-mounted share, cloud over WebDAV
pub struct DefaultAdapterFactory {
    settings: ConnectionSettings,
}

impl DefaultAdapterFactory {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, backend: &Backend) -> Result<Arc<dyn BackendAdapter>, VaultError> {
        match backend {
            Backend::Smb(target) => Ok(Arc::new(SmbAdapter::new(
                target.clone(),
                Arc::new(MountedShareConnector::new()),
                self.settings,
            ))),
            Backend::Cloud(target) => Ok(Arc::new(WebDavAdapter::new(target.clone(), self.settings)?)),
        }
    }
}
