//! Configuration module for xq-harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! Every section is optional; missing keys fall back to the defaults the
//! harvester was tuned with against the live service.
//!
//! # Example
//!
//! ```no_run
//! use xq_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Request delay: {}s", config.crawler.request_delay_seconds);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    ApiConfig, AuthConfig, CheckpointConfig, Config, CrawlerConfig, StorageConfig, StorageType,
    TextEncoding,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::{validate, MAX_CONCURRENCY};
