// Sig-Vault - unified media library over SMB/NAS shares and Nextcloud WebDAV
// Browse either backend, stream transfers in the background, keep downloads in a local cache

pub mod events;
pub mod media_cache;
pub mod path_model;
pub mod providers;
pub mod transfer_pool;
pub mod vault;
pub mod vault_config;

pub use events::{EventBus, EventSubscription, VaultEvent};
pub use media_cache::{CachePin, CacheRecord, EvictionReport, MediaCache};
pub use path_model::{join_path, normalize, PathFlavor, RemotePath};
pub use providers::{
    AdapterFactory, Backend, BackendAdapter, BackendId, BackendKind, BackendSummary, CloudTarget,
    Credentials, Entry, EntryKind, ErrorKind, RemoteRef, ServerCapabilities, SmbTarget, StorageQuota,
    VaultError,
};
pub use transfer_pool::{
    EngineSettings, JobId, ProgressSubscription, TransferDirection, TransferEngine, TransferHandle,
    TransferSnapshot, TransferState,
};
pub use vault::Vault;
pub use vault_config::{load_vault_config, load_vault_config_from, save_vault_config, StorageMode, VaultConfig};
