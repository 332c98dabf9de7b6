//! Shared fixtures: mock API routes, configuration and run wiring

use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xq_harvest::checkpoint::CheckpointLedger;
use xq_harvest::config::{Config, StorageType};
use xq_harvest::crawler::{build_fetcher, Endpoint, Fetcher, KlineEndpoint, Orchestrator};
use xq_harvest::storage::{open_storage, RecordStore};

pub const KLINE_PATH: &str = "/v5/stock/chart/kline.json";

/// Configuration pointing every host at `server` and every file into `dir`
pub fn test_config(server: &MockServer, dir: &TempDir, storage_type: StorageType) -> Config {
    let mut config = Config::default();

    config.api.base_url = server.uri();
    config.api.stock_base_url = server.uri();

    config.crawler.request_delay_seconds = 0.0;
    config.crawler.backoff_base_seconds = 0.0;
    config.crawler.max_retries = 2;
    config.crawler.timeout_seconds = 5;

    let root = dir.path();
    config.storage.storage_type = storage_type;
    config.storage.csv_path = path_string(&root.join("csv"));
    config.storage.backup_path = path_string(&root.join("backup"));
    config.storage.database_path = path_string(&root.join("harvest.db"));
    config.checkpoint.path = path_string(&root.join("checkpoints.db"));

    config
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Handshake hands out a session cookie; verification accepts any token
pub async fn mount_session(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("set-cookie", "xq_a_token=test-session; path=/"),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/hq"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>hq</html>"))
        .mount(server)
        .await;
}

/// A kline response with one bar per timestamp (milliseconds)
pub fn kline_body(symbol: &str, timestamps_ms: &[i64]) -> Value {
    let items: Vec<Value> = timestamps_ms
        .iter()
        .map(|ts| json!([ts, 1000, 10.0, 10.5, 9.5, 10.2, 0.2, 1.98, 0.35]))
        .collect();
    json!({
        "data": {"symbol": symbol, "item": items},
        "error_code": 0,
        "error_description": ""
    })
}

pub async fn mount_kline(server: &MockServer, symbol: &str, timestamps_ms: &[i64]) {
    Mock::given(method("GET"))
        .and(path(KLINE_PATH))
        .and(query_param("symbol", symbol))
        .respond_with(ResponseTemplate::new(200).set_body_json(kline_body(symbol, timestamps_ms)))
        .mount(server)
        .await;
}

/// Everything one run needs, opened against a test configuration
pub struct Harness {
    pub fetcher: Arc<Fetcher>,
    pub store: Arc<dyn RecordStore>,
    pub ledger: Arc<CheckpointLedger>,
    pub endpoint: Arc<dyn Endpoint>,
    pub concurrency: usize,
}

impl Harness {
    pub fn new(config: &Config, endpoint: Arc<dyn Endpoint>) -> Self {
        let fetcher = build_fetcher(config).expect("Failed to build fetcher");
        let store = open_storage(&config.storage).expect("Failed to open storage");
        let ledger = Arc::new(
            CheckpointLedger::open(Path::new(&config.checkpoint.path), &endpoint.job_name())
                .expect("Failed to open ledger"),
        );

        Self {
            fetcher,
            store,
            ledger,
            endpoint,
            concurrency: config.crawler.concurrency,
        }
    }

    pub fn kline(config: &Config) -> Self {
        Self::new(config, Arc::new(KlineEndpoint::default()))
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.fetcher.clone(),
            self.store.clone(),
            self.ledger.clone(),
            self.endpoint.clone(),
            self.concurrency,
        )
    }
}
