//! Credential refresh and authentication failure during runs

use crate::common::{kline_body, mount_kline, test_config, Harness, KLINE_PATH};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header_regex, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xq_harvest::config::StorageType;
use xq_harvest::state::{ItemStatus, Universe};
use xq_harvest::{HarvestError, RunMode};

const CHALLENGE_PAGE: &str =
    "<html><script>var arg1='3A1B5C7D9E';</script><noscript>acw_sc__v2</noscript></html>";

#[tokio::test]
async fn test_rejected_token_is_refreshed_once() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("set-cookie", "xq_a_token=fresh; path=/"),
        )
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hq"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>hq</html>"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(KLINE_PATH))
        .and(query_param("symbol", "SH600000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error_code": 400016,
            "error_description": "遇到错误，请刷新页面或者重新登录帐号后再试"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(KLINE_PATH))
        .and(query_param("symbol", "SH600000"))
        .and(header_regex("cookie", "xq_a_token=fresh"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(kline_body("SH600000", &[1_700_000_000_000])),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    // A single attempt: the auth retry must not need the transient budget
    let mut config = test_config(&server, &dir, StorageType::File);
    config.crawler.max_retries = 1;
    let harness = Harness::kline(&config);

    let report = harness
        .orchestrator()
        .run(&Universe::from_symbols(&["SH600000"]), RunMode::Resume)
        .await
        .unwrap();

    assert!(!report.is_aborted());
    assert_eq!(report.stats.succeeded, 1);
    assert_eq!(report.stats.rows_inserted, 1);
    assert_eq!(harness.fetcher.credentials().refresh_count(), 2);
}

#[tokio::test]
async fn test_unavailable_authentication_aborts_the_run() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("set-cookie", "xq_a_token=s; path=/"),
        )
        .mount(&server)
        .await;
    // Verification never gets past the challenge
    Mock::given(method("GET"))
        .and(path("/hq"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHALLENGE_PAGE))
        .mount(&server)
        .await;
    mount_kline(&server, "SH600000", &[1_700_000_000_000]).await;

    let dir = TempDir::new().unwrap();
    let config = test_config(&server, &dir, StorageType::File);
    let harness = Harness::kline(&config);
    let symbols = ["SH600000", "SH600004", "SZ000001"];

    let report = harness
        .orchestrator()
        .run(&Universe::from_symbols(&symbols), RunMode::Resume)
        .await
        .unwrap();

    assert!(report.is_aborted());
    assert_eq!(report.stats.attempted, 1);
    assert_eq!(report.stats.failed, 1);
    assert!(report.stats.aborted);

    let first = harness.ledger.record("SH600000").unwrap().unwrap();
    assert_eq!(first.status, ItemStatus::Failed);
    for symbol in &symbols[1..] {
        let record = harness.ledger.record(symbol).unwrap().unwrap();
        assert_eq!(record.status, ItemStatus::Pending);
        assert_eq!(record.attempts, 0);
    }

    let kline_calls = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == KLINE_PATH)
        .count();
    assert_eq!(kline_calls, 0);

    assert!(matches!(
        report.into_result(),
        Err(HarvestError::RunAborted { completed: 0, .. })
    ));
}
