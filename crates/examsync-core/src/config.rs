use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from examsync.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExamSyncConfig {
    pub app: AppConfig,
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub exam: ExamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

/// Which OpenDAL service backs the remote durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    /// Process-local, lost on exit. Useful for tests and demos.
    Memory,
    /// Local directory, e.g. a mounted network share.
    Fs,
    /// Any S3-compatible endpoint.
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub backend: RemoteBackend,
    /// Root directory (fs) or key prefix (s3)
    pub root: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
    /// Object holding the serialized record tree
    pub object_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// JSON file backing the local cache
    pub path: PathBuf,
    /// Byte quota for cached values (0 = unlimited)
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Replay attempts before a queued operation is dead-lettered
    pub max_retries: u32,
    /// Interval between remote health probes
    pub probe_interval_secs: u64,
    /// Prefix for IDs minted while offline
    pub provisional_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExamConfig {
    /// Duration used when an exam is created without one
    pub default_duration_minutes: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::Fs,
            root: "~/.local/share/examsync/remote".into(),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "examsync".into(),
            enforce_tls: false,
            object_key: "db.json".into(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/examsync/cache.json"),
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            probe_interval_secs: 15,
            provisional_prefix: "local:".into(),
        }
    }
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            default_duration_minutes: 30,
        }
    }
}
