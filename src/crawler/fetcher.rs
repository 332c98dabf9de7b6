//! Rate-limited, authenticated HTTP fetcher
//!
//! This module handles every request to the quote API:
//! - Building the HTTP client with browser-like default headers
//! - Pacing through the shared `RequestGate`
//! - Attaching the current session credential
//! - Retrying transient failures with exponential backoff
//! - Refreshing the credential once when a request is rejected as unauthenticated
//! - Classifying everything else into `FetchError`

use crate::auth::{is_challenge_page, AuthError, Credential, CredentialStore};
use crate::config::{ApiConfig, CrawlerConfig};
use crate::crawler::endpoint::{EndpointKind, Host, Params};
use crate::crawler::scheduler::{backoff_delay, RequestGate};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, REFERER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// API `error_code` meaning the session or anti-bot token is not accepted
pub const AUTH_ERROR_CODE: i64 = 400016;

/// Why a fetch did not produce a payload
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Retries exhausted on timeouts, connection errors, 5xx or 429
    #[error("Transient failure after {attempts} attempts: {reason}")]
    Transient { reason: String, attempts: u32 },

    /// No usable credential, or a freshly refreshed one was rejected too
    #[error("Authentication unavailable: {0}")]
    AuthUnavailable(AuthError),

    /// The service refused the request; retrying will not help
    #[error("Rejected (HTTP {status}): {reason}")]
    PermanentRejected { status: u16, reason: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Short label used in logs and ledger entries
    pub fn label(&self) -> &'static str {
        match self {
            FetchError::Transient { .. } => "transient",
            FetchError::AuthUnavailable(_) => "auth_unavailable",
            FetchError::PermanentRejected { .. } => "permanent_rejected",
            FetchError::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// Validated, non-empty response body for one request
#[derive(Debug, Clone)]
pub struct Payload {
    pub kind: EndpointKind,
    pub body: Value,
    pub fetched_at: DateTime<Utc>,
}

/// Classification of a single HTTP exchange
#[derive(Debug)]
enum Attempt {
    Success(Value),
    AuthRejected,
    Transient(String),
    Permanent { status: u16, reason: String },
    Malformed(String),
}

/// Builds the HTTP client used for both the handshake and data requests
///
/// # Arguments
///
/// * `api` - Remote host and identity configuration
/// * `crawler` - Supplies the per-request timeout
pub fn build_http_client(api: &ApiConfig, crawler: &CrawlerConfig) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));

    let referer = format!("{}{}", api.base_url.trim_end_matches('/'), api.verify_path);
    if let Ok(value) = HeaderValue::from_str(&referer) {
        headers.insert(REFERER, value);
    }

    Client::builder()
        .user_agent(api.user_agent.clone())
        .default_headers(headers)
        .timeout(crawler.timeout())
        .connect_timeout(crawler.timeout().min(Duration::from_secs(10)))
        .gzip(true)
        .brotli(true)
        .build()
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Reads the API-level error code, if the body carries a non-zero one
fn api_error(body: &Value) -> Option<(i64, String)> {
    let code = match body.get("error_code")? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    if code == 0 {
        return None;
    }
    let description = body
        .get("error_description")
        .and_then(Value::as_str)
        .unwrap_or("unknown API error")
        .to_string();
    Some((code, description))
}

fn is_empty_payload(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Maps one response to an `Attempt`
fn classify(status: StatusCode, body: &str) -> Attempt {
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || is_challenge_page(body)
    {
        return Attempt::AuthRejected;
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Attempt::Transient(format!("HTTP {}", status.as_u16()));
    }

    let parsed: Option<Value> = serde_json::from_str(body).ok();

    if !status.is_success() {
        if let Some((code, description)) = parsed.as_ref().and_then(api_error) {
            if code == AUTH_ERROR_CODE {
                return Attempt::AuthRejected;
            }
            return Attempt::Permanent {
                status: status.as_u16(),
                reason: format!("error_code {}: {}", code, description),
            };
        }
        return Attempt::Permanent {
            status: status.as_u16(),
            reason: snippet(body),
        };
    }

    let Some(value) = parsed else {
        if body.trim().is_empty() {
            return Attempt::Malformed("empty body".to_string());
        }
        return Attempt::Malformed(format!("body is not JSON: {}", snippet(body)));
    };

    if let Some((code, description)) = api_error(&value) {
        if code == AUTH_ERROR_CODE {
            return Attempt::AuthRejected;
        }
        return Attempt::Permanent {
            status: status.as_u16(),
            reason: format!("error_code {}: {}", code, description),
        };
    }

    if is_empty_payload(&value) {
        return Attempt::Malformed("empty payload".to_string());
    }

    Attempt::Success(value)
}

/// Sends requests for the crawl orchestrator
pub struct Fetcher {
    client: Client,
    credentials: Arc<CredentialStore>,
    gate: Arc<RequestGate>,
    base_url: String,
    stock_base_url: String,
    max_retries: u32,
    backoff_base: Duration,
}

impl Fetcher {
    pub fn new(
        client: Client,
        credentials: Arc<CredentialStore>,
        gate: Arc<RequestGate>,
        api: &ApiConfig,
        crawler: &CrawlerConfig,
    ) -> Self {
        Self {
            client,
            credentials,
            gate,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            stock_base_url: api.stock_base_url.trim_end_matches('/').to_string(),
            max_retries: crawler.max_retries.max(1),
            backoff_base: crawler.backoff_base(),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    fn url_for(&self, host: Host, path: &str) -> String {
        let host = match host {
            Host::Base => &self.base_url,
            Host::Stock => &self.stock_base_url,
        };
        format!("{}{}", host, path)
    }

    async fn send_once(&self, url: &str, params: &Params, credential: &Credential) -> Attempt {
        self.gate.acquire().await;

        let response = match self
            .client
            .get(url)
            .query(params)
            .header(COOKIE, credential.cookie_header())
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Attempt::Transient("request timeout".to_string()),
            Err(e) if e.is_connect() => {
                return Attempt::Transient(format!("connection failed: {}", e))
            }
            Err(e) => return Attempt::Transient(e.to_string()),
        };

        let status = response.status();
        match response.text().await {
            Ok(body) => classify(status, &body),
            Err(e) => Attempt::Transient(format!("reading body failed: {}", e)),
        }
    }

    /// Fetches one endpoint with the given query parameters
    ///
    /// # Retry Logic
    ///
    /// | Condition | Action |
    /// |-----------|--------|
    /// | Timeout, connect error, 5xx, 429 | Back off and retry, up to `max-retries` attempts |
    /// | 401/403, challenge page, `error_code` 400016 | Refresh credential, retry once (not counted) |
    /// | Second auth rejection | `AuthUnavailable` |
    /// | 404, other 4xx, other `error_code` | `PermanentRejected` |
    /// | Non-JSON or empty body | `MalformedResponse` |
    pub async fn fetch(&self, kind: EndpointKind, params: &Params) -> Result<Payload, FetchError> {
        self.fetch_from(kind, kind.host(), kind.path(), params).await
    }

    /// Like [`fetch`](Self::fetch), against an explicit host and path
    pub async fn fetch_from(
        &self,
        kind: EndpointKind,
        host: Host,
        path: &str,
        params: &Params,
    ) -> Result<Payload, FetchError> {
        let url = self.url_for(host, path);
        let mut attempts = 0u32;
        let mut refreshed_for_rejection = false;

        loop {
            let credential = self
                .credentials
                .get_valid_credential()
                .await
                .map_err(FetchError::AuthUnavailable)?;

            match self.send_once(&url, params, &credential).await {
                Attempt::Success(body) => {
                    return Ok(Payload {
                        kind,
                        body,
                        fetched_at: Utc::now(),
                    });
                }
                Attempt::AuthRejected => {
                    if refreshed_for_rejection {
                        return Err(FetchError::AuthUnavailable(
                            AuthError::RejectedAfterRefresh,
                        ));
                    }
                    tracing::warn!(endpoint = kind.as_str(), "Request rejected as unauthenticated, refreshing credential");
                    refreshed_for_rejection = true;
                    self.credentials.invalidate(&credential).await;
                }
                Attempt::Transient(reason) => {
                    attempts += 1;
                    if attempts >= self.max_retries {
                        return Err(FetchError::Transient { reason, attempts });
                    }
                    let delay = backoff_delay(self.backoff_base, attempts);
                    tracing::debug!(
                        endpoint = kind.as_str(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Attempt::Permanent { status, reason } => {
                    return Err(FetchError::PermanentRejected { status, reason });
                }
                Attempt::Malformed(reason) => {
                    return Err(FetchError::MalformedResponse(reason));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SessionTokens, TokenRefresher};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticRefresher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenRefresher for StaticRefresher {
        async fn refresh(&self) -> Result<SessionTokens, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SessionTokens {
                session_token: format!("s{}", n),
                anti_bot_token: format!("t{}", n),
                cookies: vec![("xq_a_token".to_string(), format!("s{}", n))],
            })
        }
    }

    fn fetcher_for(server: &MockServer, max_retries: u32) -> (Fetcher, Arc<StaticRefresher>) {
        let api = ApiConfig {
            base_url: server.uri(),
            stock_base_url: server.uri(),
            ..ApiConfig::default()
        };
        let crawler = CrawlerConfig {
            request_delay_seconds: 0.0,
            max_retries,
            backoff_base_seconds: 0.0,
            ..CrawlerConfig::default()
        };
        let refresher = Arc::new(StaticRefresher {
            calls: AtomicU32::new(0),
        });
        let credentials = Arc::new(CredentialStore::new(
            refresher.clone(),
            Duration::from_secs(3600),
        ));
        let client = build_http_client(&api, &crawler).unwrap();
        let gate = Arc::new(RequestGate::new(Duration::ZERO));
        (
            Fetcher::new(client, credentials, gate, &api, &crawler),
            refresher,
        )
    }

    fn kline_params(symbol: &str) -> Params {
        vec![("symbol".to_string(), symbol.to_string())]
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(StatusCode::OK, r#"{"data":{"item":[]},"error_code":0}"#),
            Attempt::Success(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, r#"{"error_code":400016,"error_description":"login"}"#),
            Attempt::AuthRejected
        ));
        assert!(matches!(
            classify(StatusCode::OK, r#"{"error_code":"400016"}"#),
            Attempt::AuthRejected
        ));
        assert!(matches!(
            classify(StatusCode::OK, "<html><script>var arg1='AB';</script></html>"),
            Attempt::AuthRejected
        ));
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, "nope"),
            Attempt::Permanent { status: 404, .. }
        ));
        assert!(matches!(
            classify(StatusCode::OK, r#"{"error_code":10010,"error_description":"bad symbol"}"#),
            Attempt::Permanent { status: 200, .. }
        ));
        assert!(matches!(classify(StatusCode::OK, "null"), Attempt::Malformed(_)));
        assert!(matches!(classify(StatusCode::OK, ""), Attempt::Malformed(_)));
        assert!(matches!(classify(StatusCode::OK, "{}"), Attempt::Malformed(_)));
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, ""),
            Attempt::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, ""),
            Attempt::Transient(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_success_sends_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/stock/chart/kline.json"))
            .and(query_param("symbol", "SH600000"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":{"item":[[1700000000000,1,1,1,1,1,0,0,0]]},"error_code":0}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let (fetcher, refresher) = fetcher_for(&server, 3);
        let payload = fetcher
            .fetch(EndpointKind::Kline, &kline_params("SH600000"))
            .await
            .unwrap();

        assert_eq!(payload.kind, EndpointKind::Kline);
        assert!(payload.body["data"]["item"].is_array());
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"list":[1]}"#))
            .mount(&server)
            .await;

        let (fetcher, _) = fetcher_for(&server, 3);
        let result = fetcher
            .fetch(EndpointKind::FinancialIndicator, &kline_params("SH600000"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let (fetcher, _) = fetcher_for(&server, 3);
        let result = fetcher
            .fetch(EndpointKind::CompanyProfile, &kline_params("SH600000"))
            .await;
        assert!(matches!(result, Err(FetchError::Transient { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_not_found_is_permanent_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let (fetcher, _) = fetcher_for(&server, 3);
        let result = fetcher
            .fetch(EndpointKind::CompanyProfile, &kline_params("SH600000"))
            .await;
        assert!(matches!(
            result,
            Err(FetchError::PermanentRejected { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_auth_rejection_refreshes_once_without_spending_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"tqCompInfo":{}}"#))
            .mount(&server)
            .await;

        // One retry in the budget: the auth retry must not consume it
        let (fetcher, refresher) = fetcher_for(&server, 1);
        let result = fetcher
            .fetch(EndpointKind::CompanyProfile, &kline_params("SH600000"))
            .await;

        assert!(result.is_ok());
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_auth_rejection_is_auth_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error_code":400016,"error_description":"relogin"}"#),
            )
            .expect(2)
            .mount(&server)
            .await;

        let (fetcher, refresher) = fetcher_for(&server, 3);
        let result = fetcher
            .fetch(EndpointKind::Kline, &kline_params("SH600000"))
            .await;

        assert!(matches!(
            result,
            Err(FetchError::AuthUnavailable(AuthError::RejectedAfterRefresh))
        ));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }
}
