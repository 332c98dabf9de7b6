//! xq-harvest: a resumable market-data harvester
//!
//! This crate walks a universe of instruments against a token-protected quote
//! API, paces and retries every request, and persists the results into either
//! CSV files or a pooled SQLite database without duplicating rows across
//! interrupted runs.

pub mod auth;
pub mod checkpoint;
pub mod config;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for xq-harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Authentication error: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Universe error: {0}")]
    Universe(String),

    #[error("Run aborted after {completed} completed items: {reason}")]
    RunAborted { completed: u64, reason: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for xq-harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Orchestrator, RunMode, RunReport};
pub use state::ItemStatus;
pub use storage::{open_storage, DuplicatePolicy, Record, RecordStore, UniqueKey};
