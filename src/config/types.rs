use crate::storage::DuplicatePolicy;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for xq-harvest
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// Remote API endpoints and request identity
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host serving the F10 and quote-list endpoints, and the session handshake
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Host serving chart (kline) data
    #[serde(rename = "stock-base-url")]
    pub stock_base_url: String,

    #[serde(rename = "user-agent")]
    pub user_agent: String,

    /// Path requested without credentials to obtain a session cookie
    #[serde(rename = "handshake-path")]
    pub handshake_path: String,

    /// Path requested with both tokens to confirm they are accepted
    #[serde(rename = "verify-path")]
    pub verify_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://xueqiu.com".to_string(),
            stock_base_url: "https://stock.xueqiu.com".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            handshake_path: "/".to_string(),
            verify_path: "/hq".to_string(),
        }
    }
}

/// Session credential lifecycle
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// How long a verified credential is trusted before it is refreshed
    #[serde(rename = "credential-ttl-seconds")]
    pub credential_ttl_seconds: u64,

    /// Distinct anti-bot tokens tried per refresh before giving up
    #[serde(rename = "max-token-attempts")]
    pub max_token_attempts: u32,

    #[serde(rename = "session-cookie")]
    pub session_cookie: String,

    #[serde(rename = "anti-bot-cookie")]
    pub anti_bot_cookie: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credential_ttl_seconds: 3600,
            max_token_attempts: 3,
            session_cookie: "xq_a_token".to_string(),
            anti_bot_cookie: "acw_sc__v2".to_string(),
        }
    }
}

impl AuthConfig {
    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_seconds)
    }
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Minimum time between any two outbound requests (seconds)
    #[serde(rename = "request-delay-seconds")]
    pub request_delay_seconds: f64,

    /// Attempts per request before a transient failure is surfaced
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Per-request timeout (seconds)
    #[serde(rename = "timeout-seconds")]
    pub timeout_seconds: u64,

    /// First retry backoff; doubles on every further attempt
    #[serde(rename = "backoff-base-seconds")]
    pub backoff_base_seconds: f64,

    /// Number of items processed in parallel
    pub concurrency: usize,

    /// Rows per quote-list page
    #[serde(rename = "page-size")]
    pub page_size: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            request_delay_seconds: 0.3,
            max_retries: 3,
            timeout_seconds: 30,
            backoff_base_seconds: 1.0,
            concurrency: 1,
            page_size: 90,
        }
    }
}

impl CrawlerConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_secs_f64(self.request_delay_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_base_seconds)
    }
}

/// Which storage backend records are written to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// One CSV file per table
    #[default]
    File,
    /// Pooled SQLite database
    Relational,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::File => "file",
            StorageType::Relational => "relational",
        }
    }
}

/// Text encoding of CSV files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TextEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    /// UTF-8 with a leading byte-order mark, for spreadsheet tools
    #[default]
    #[serde(rename = "utf-8-sig")]
    Utf8Bom,
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,

    /// Directory holding one `<table>.csv` per table
    #[serde(rename = "csv-path")]
    pub csv_path: String,

    #[serde(rename = "backup-path")]
    pub backup_path: String,

    pub encoding: TextEncoding,

    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Rows written per flush
    #[serde(rename = "chunk-size-write")]
    pub chunk_size_write: usize,

    /// Rows decoded per read batch
    #[serde(rename = "chunk-size-read")]
    pub chunk_size_read: usize,

    /// Files larger than this are never loaded wholesale
    #[serde(rename = "large-file-threshold-bytes")]
    pub large_file_threshold_bytes: u64,

    /// Idle connections kept by the SQLite pool
    #[serde(rename = "pool-size")]
    pub pool_size: u32,

    #[serde(rename = "pool-max-size")]
    pub pool_max_size: u32,

    #[serde(rename = "duplicate-policy")]
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::File,
            csv_path: "data/csv".to_string(),
            backup_path: "data/backup".to_string(),
            encoding: TextEncoding::Utf8Bom,
            database_path: "data/xq_harvest.db".to_string(),
            chunk_size_write: 10_000,
            chunk_size_read: 50_000,
            large_file_threshold_bytes: 50 * 1024 * 1024,
            pool_size: 5,
            pool_max_size: 10,
            duplicate_policy: DuplicatePolicy::Skip,
        }
    }
}

/// Checkpoint ledger location
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: "data/checkpoints.db".to_string(),
        }
    }
}
