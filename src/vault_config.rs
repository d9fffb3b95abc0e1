// Sig-Vault Configuration Module
// Saved settings for the NAS share, the cloud account, transfers and the local cache

use base64::Engine;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::providers::{Backend, CloudTarget, ConnectionSettings, Credentials, SmbTarget, VaultError};
use crate::transfer_pool::EngineSettings;

const CONFIG_DIR: &str = "sig-vault";
const CONFIG_FILE: &str = "config.json";
const PASSWORD_B64_PREFIX: &str = "b64:";

pub const MIN_CONCURRENT_TRANSFERS: usize = 1;
pub const MAX_CONCURRENT_TRANSFERS: usize = 8;
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_READ_WRITE_TIMEOUT_MS: u64 = 30_000;

/// Which backend the vault starts on
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// SMB share on the local network
    #[default]
    #[serde(alias = "smb", alias = "nas")]
    Local,
    Cloud,
}

/// Saved settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    pub default_mode: StorageMode,
    pub local: SmbSettings,
    pub cloud: CloudSettings,
    pub transfers: TransferSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SmbSettings {
    pub server: String,
    pub share: String,
    pub username: String,
    /// Plain text or `b64:`-prefixed
    pub password: String,
    /// Local mount of the share (non-Windows hosts)
    pub mount_point: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudSettings {
    /// Server URL or full DAV root
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// App token; takes precedence over the password
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferSettings {
    pub max_concurrent_transfers: usize,
    pub connect_timeout_ms: u64,
    pub read_write_timeout_ms: u64,
    pub chunk_size: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 3,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_write_timeout_ms: DEFAULT_READ_WRITE_TIMEOUT_MS,
            chunk_size: 1024 * 1024,
        }
    }
}

impl TransferSettings {
    /// Limits handed to every adapter
    pub fn connection(&self) -> ConnectionSettings {
        let s = validate_transfer_settings(self);
        ConnectionSettings {
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            read_write_timeout: Duration::from_millis(s.read_write_timeout_ms),
            chunk_size: s.chunk_size,
        }
    }

    pub fn engine(&self) -> EngineSettings {
        let s = validate_transfer_settings(self);
        EngineSettings {
            max_concurrent: s.max_concurrent_transfers,
            chunk_size: s.chunk_size,
            ..EngineSettings::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// Defaults to the platform cache dir
    pub dir: Option<PathBuf>,
    /// Evict least-recently-fetched downloads beyond this size
    pub max_bytes: Option<u64>,
}

impl CacheSettings {
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(CONFIG_DIR),
        }
    }
}

/// Clamp transfer settings into supported ranges
pub fn validate_transfer_settings(settings: &TransferSettings) -> TransferSettings {
    let defaults = TransferSettings::default();
    TransferSettings {
        max_concurrent_transfers: settings
            .max_concurrent_transfers
            .clamp(MIN_CONCURRENT_TRANSFERS, MAX_CONCURRENT_TRANSFERS),
        connect_timeout_ms: if settings.connect_timeout_ms == 0 {
            defaults.connect_timeout_ms
        } else {
            settings.connect_timeout_ms
        },
        read_write_timeout_ms: if settings.read_write_timeout_ms == 0 {
            defaults.read_write_timeout_ms
        } else {
            settings.read_write_timeout_ms
        },
        chunk_size: settings.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
    }
}

/// Decode a stored password. `b64:` values that fail to decode yield an
/// empty secret.
pub fn decode_password(stored: &str) -> SecretString {
    let plain = match stored.strip_prefix(PASSWORD_B64_PREFIX) {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| {
                tracing::warn!("[Vault] Stored password is not valid base64, ignoring it");
                String::new()
            }),
        None => stored.to_string(),
    };
    SecretString::from(plain)
}

/// Encode a password for the settings file
pub fn encode_password(plain: &str) -> String {
    format!(
        "{}{}",
        PASSWORD_B64_PREFIX,
        base64::engine::general_purpose::STANDARD.encode(plain)
    )
}

impl VaultConfig {
    /// Build the target for `mode` from the saved settings
    pub fn backend(&self, mode: StorageMode) -> Result<Backend, VaultError> {
        match mode {
            StorageMode::Local => {
                let s = &self.local;
                if s.share.trim().is_empty() {
                    return Err(VaultError::InvalidConfig("SMB share name is empty".to_string()));
                }
                if s.server.trim().is_empty() && s.mount_point.is_none() {
                    return Err(VaultError::InvalidConfig(
                        "SMB server is empty and no mount point is set".to_string(),
                    ));
                }
                let credentials = if s.username.is_empty() {
                    Credentials::Anonymous
                } else {
                    Credentials::Password {
                        username: s.username.clone(),
                        password: decode_password(&s.password),
                    }
                };
                Ok(Backend::Smb(SmbTarget {
                    host: s.server.trim().to_string(),
                    share: s.share.trim().to_string(),
                    credentials,
                    mount_point: s.mount_point.clone(),
                }))
            }
            StorageMode::Cloud => {
                let s = &self.cloud;
                if s.base_url.trim().is_empty() {
                    return Err(VaultError::InvalidConfig("Cloud base URL is empty".to_string()));
                }
                let parsed = url::Url::parse(s.base_url.trim()).map_err(|e| {
                    VaultError::InvalidConfig(format!("Invalid cloud base URL {}: {}", s.base_url, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(VaultError::InvalidConfig(format!(
                        "Cloud base URL must be http(s): {}",
                        s.base_url
                    )));
                }
                let credentials = match s.token.as_deref().filter(|t| !t.is_empty()) {
                    Some(token) => Credentials::Token {
                        username: s.username.clone(),
                        token: SecretString::from(token.to_string()),
                    },
                    None if s.username.is_empty() => Credentials::Anonymous,
                    None => Credentials::Password {
                        username: s.username.clone(),
                        password: decode_password(&s.password),
                    },
                };
                Ok(Backend::Cloud(CloudTarget::new(&s.base_url, credentials)))
            }
        }
    }
}

/// `<config_dir>/sig-vault/config.json`
pub fn default_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

pub fn load_vault_config() -> Result<VaultConfig, VaultError> {
    load_vault_config_from(&default_config_path())
}

/// Missing file yields defaults; an unreadable or malformed one is an error
pub fn load_vault_config_from(path: &Path) -> Result<VaultConfig, VaultError> {
    if !path.exists() {
        tracing::debug!("[Vault] No config at {:?}, using defaults", path);
        return Ok(VaultConfig::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        VaultError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        VaultError::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e))
    })
}

pub fn save_vault_config(config: &VaultConfig) -> Result<(), VaultError> {
    save_vault_config_to(config, &default_config_path())
}

pub fn save_vault_config_to(config: &VaultConfig, path: &Path) -> Result<(), VaultError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| VaultError::InvalidConfig(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, content)?;
    tracing::info!("[Vault] Config saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::BackendKind;
    use secrecy::ExposeSecret;

    #[test]
    fn test_default_config() {
        let config = VaultConfig::default();
        assert_eq!(config.default_mode, StorageMode::Local);
        assert_eq!(config.transfers.max_concurrent_transfers, 3);
        assert_eq!(config.transfers.connect_timeout_ms, 10_000);
        assert!(config.cache.max_bytes.is_none());
    }

    #[test]
    fn test_validate_transfer_settings_clamps() {
        let s = validate_transfer_settings(&TransferSettings {
            max_concurrent_transfers: 0,
            connect_timeout_ms: 0,
            read_write_timeout_ms: 5,
            chunk_size: 1,
        });
        assert_eq!(s.max_concurrent_transfers, 1);
        assert_eq!(s.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(s.read_write_timeout_ms, 5);
        assert_eq!(s.chunk_size, MIN_CHUNK_SIZE);

        let s = validate_transfer_settings(&TransferSettings {
            max_concurrent_transfers: 50,
            chunk_size: usize::MAX,
            ..TransferSettings::default()
        });
        assert_eq!(s.max_concurrent_transfers, 8);
        assert_eq!(s.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_password_decoding() {
        assert_eq!(decode_password("hunter2").expose_secret(), "hunter2");
        assert_eq!(decode_password(&encode_password("s3cr€t")).expose_secret(), "s3cr€t");
        assert_eq!(decode_password("b64:!!!not base64").expose_secret(), "");
    }

    #[test]
    fn test_mode_aliases() {
        let config: VaultConfig = serde_json::from_str(r#"{"default_mode": "nas"}"#).unwrap();
        assert_eq!(config.default_mode, StorageMode::Local);
        let config: VaultConfig = serde_json::from_str(r#"{"default_mode": "cloud"}"#).unwrap();
        assert_eq!(config.default_mode, StorageMode::Cloud);
    }

    #[test]
    fn test_backend_from_settings() {
        let mut config = VaultConfig::default();
        assert!(matches!(config.backend(StorageMode::Local), Err(VaultError::InvalidConfig(_))));
        assert!(matches!(config.backend(StorageMode::Cloud), Err(VaultError::InvalidConfig(_))));

        config.local.server = "NAS".to_string();
        config.local.share = "media".to_string();
        let smb = config.backend(StorageMode::Local).unwrap();
        assert_eq!(smb.kind(), BackendKind::Smb);
        assert_eq!(smb.id().as_str(), "smb://nas/media");

        config.cloud.base_url = "https://cloud.example.com".to_string();
        config.cloud.username = "ana".to_string();
        config.cloud.token = Some("tok".to_string());
        match config.backend(StorageMode::Cloud).unwrap() {
            Backend::Cloud(target) => {
                assert_eq!(
                    target.base_url(),
                    "https://cloud.example.com/remote.php/dav/files/ana/"
                );
                assert!(matches!(target.credentials, Credentials::Token { .. }));
            }
            other => panic!("unexpected backend {:?}", other.kind()),
        }
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        assert_eq!(load_vault_config_from(&path).unwrap(), VaultConfig::default());

        let mut config = VaultConfig::default();
        config.default_mode = StorageMode::Cloud;
        config.cache.max_bytes = Some(1 << 30);
        save_vault_config_to(&config, &path).unwrap();
        assert_eq!(load_vault_config_from(&path).unwrap(), config);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_vault_config_from(&path), Err(VaultError::InvalidConfig(_))));
    }
}
