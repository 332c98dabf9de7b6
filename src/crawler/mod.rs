//! Crawler module for the resumable harvest
//!
//! This module contains the core harvesting logic, including:
//! - The endpoint catalogue and response parsers
//! - Authenticated, rate-limited fetching with retry logic
//! - Universe sources
//! - Overall run orchestration

mod coordinator;
mod endpoint;
mod fetcher;
mod parser;
mod scheduler;
mod universe;

pub use coordinator::{Orchestrator, RunMode, RunReport};
pub use endpoint::{
    endpoint_for, AdjustType, CompanyProfileEndpoint, Endpoint, EndpointKind, Fallback,
    FinancialIndicatorEndpoint, FinancialStatementEndpoint, Host, KlineEndpoint, KlinePeriod,
    Params, QuoteListEndpoint, StatementKind,
};
pub use fetcher::{build_http_client, FetchError, Fetcher, Payload, AUTH_ERROR_CODE};
pub use parser::{
    parse_company_profile, parse_financial_indicators, parse_financial_statement, parse_kline,
    parse_quote_list, quote_list_count,
};
pub use scheduler::{backoff_delay, RequestGate, MAX_BACKOFF};
pub use universe::{
    QuotePageUniverse, StaticUniverse, StoredUniverse, UniverseSource, DEFAULT_STOCK_TYPES,
};

use crate::auth::{CredentialStore, HttpTokenRefresher};
use crate::config::Config;
use crate::Result;
use std::sync::Arc;

/// Wires the HTTP client, credential store and rate gate into a fetcher
///
/// The credential store starts empty; the first request performs the
/// handshake.
///
/// # Example
///
/// ```no_run
/// use xq_harvest::config::load_config;
/// use xq_harvest::crawler::build_fetcher;
/// use std::path::Path;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new("config.toml"))?;
/// let fetcher = build_fetcher(&config)?;
/// # Ok(())
/// # }
/// ```
pub fn build_fetcher(config: &Config) -> Result<Arc<Fetcher>> {
    let client = build_http_client(&config.api, &config.crawler)?;
    let refresher = HttpTokenRefresher::new(client.clone(), &config.api, &config.auth);
    let credentials = Arc::new(CredentialStore::new(
        Arc::new(refresher),
        config.auth.credential_ttl(),
    ));
    let gate = Arc::new(RequestGate::new(config.crawler.request_delay()));

    Ok(Arc::new(Fetcher::new(
        client,
        credentials,
        gate,
        &config.api,
        &config.crawler,
    )))
}
