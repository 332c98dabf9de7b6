use crate::config::types::{
    ApiConfig, AuthConfig, CheckpointConfig, Config, CrawlerConfig, StorageConfig,
};
use crate::ConfigError;
use url::Url;

/// Upper bound on parallel workers; the service throttles harder beyond this
pub const MAX_CONCURRENCY: usize = 8;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_api_config(&config.api)?;
    validate_auth_config(&config.auth)?;
    validate_crawler_config(&config.crawler)?;
    validate_storage_config(&config.storage)?;
    validate_checkpoint_config(&config.checkpoint)?;
    Ok(())
}

fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    validate_base_url("base-url", &config.base_url)?;
    validate_base_url("stock-base-url", &config.stock_base_url)?;

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    for (name, path) in [
        ("handshake-path", &config.handshake_path),
        ("verify-path", &config.verify_path),
    ] {
        if !path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "{} must start with '/', got '{}'",
                name, path
            )));
        }
    }

    Ok(())
}

fn validate_base_url(name: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {} '{}': {}", name, value, e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "{} must use http or https, got '{}'",
            name,
            url.scheme()
        )));
    }

    Ok(())
}

fn validate_auth_config(config: &AuthConfig) -> Result<(), ConfigError> {
    if config.credential_ttl_seconds < 1 {
        return Err(ConfigError::Validation(
            "credential-ttl-seconds must be >= 1".to_string(),
        ));
    }

    if config.max_token_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max-token-attempts must be >= 1, got {}",
            config.max_token_attempts
        )));
    }

    if config.session_cookie.is_empty() || config.anti_bot_cookie.is_empty() {
        return Err(ConfigError::Validation(
            "cookie names cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if !config.request_delay_seconds.is_finite() || config.request_delay_seconds < 0.0 {
        return Err(ConfigError::Validation(format!(
            "request-delay-seconds must be >= 0, got {}",
            config.request_delay_seconds
        )));
    }

    if !config.backoff_base_seconds.is_finite() || config.backoff_base_seconds < 0.0 {
        return Err(ConfigError::Validation(format!(
            "backoff-base-seconds must be >= 0, got {}",
            config.backoff_base_seconds
        )));
    }

    if config.max_retries < 1 {
        return Err(ConfigError::Validation(format!(
            "max-retries must be >= 1, got {}",
            config.max_retries
        )));
    }

    if config.timeout_seconds < 1 {
        return Err(ConfigError::Validation(format!(
            "timeout-seconds must be >= 1, got {}",
            config.timeout_seconds
        )));
    }

    if config.concurrency < 1 || config.concurrency > MAX_CONCURRENCY {
        return Err(ConfigError::Validation(format!(
            "concurrency must be between 1 and {}, got {}",
            MAX_CONCURRENCY, config.concurrency
        )));
    }

    if config.page_size < 1 {
        return Err(ConfigError::Validation(
            "page-size must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("csv-path", &config.csv_path),
        ("backup-path", &config.backup_path),
        ("database-path", &config.database_path),
    ] {
        if value.is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
        }
    }

    if config.chunk_size_write < 1 || config.chunk_size_read < 1 {
        return Err(ConfigError::Validation(format!(
            "chunk sizes must be >= 1, got write={} read={}",
            config.chunk_size_write, config.chunk_size_read
        )));
    }

    if config.pool_size < 1 || config.pool_size > config.pool_max_size {
        return Err(ConfigError::Validation(format!(
            "pool-size must be between 1 and pool-max-size ({}), got {}",
            config.pool_max_size, config.pool_size
        )));
    }

    Ok(())
}

fn validate_checkpoint_config(config: &CheckpointConfig) -> Result<(), ConfigError> {
    if config.path.is_empty() {
        return Err(ConfigError::Validation(
            "checkpoint path cannot be empty".to_string(),
        ));
    }
    Ok(())
}
