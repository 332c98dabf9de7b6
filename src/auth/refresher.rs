//! Obtaining a fresh session from the remote service

use crate::auth::credential::cookie_header;
use crate::auth::{is_challenge_page, AuthError};
use crate::config::{ApiConfig, AuthConfig};
use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::Client;
use sha2::{Digest, Sha256};

/// Raw tokens produced by one successful refresh
#[derive(Clone)]
pub struct SessionTokens {
    pub session_token: String,
    pub anti_bot_token: String,
    pub cookies: Vec<(String, String)>,
}

/// Performs one full refresh sequence
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<SessionTokens, AuthError>;
}

/// Inputs to the anti-bot token function
#[derive(Debug, Clone)]
pub struct TokenSeed {
    pub timestamp_ms: i64,
    pub session_id: String,
    /// 1-based; each attempt must produce a distinct token
    pub attempt: u32,
    /// `arg1` value from the most recent challenge page, if any
    pub challenge: Option<String>,
}

/// The opaque anti-bot token algorithm
pub trait AntiBotTokenDeriver: Send + Sync {
    fn derive(&self, seed: &TokenSeed) -> Result<String, AuthError>;
}

impl<F> AntiBotTokenDeriver for F
where
    F: Fn(&TokenSeed) -> Result<String, AuthError> + Send + Sync,
{
    fn derive(&self, seed: &TokenSeed) -> Result<String, AuthError> {
        self(seed)
    }
}

/// Placeholder deriver: SHA-256 over the seed, hex encoded, 40 characters
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestTokenDeriver;

impl AntiBotTokenDeriver for DigestTokenDeriver {
    fn derive(&self, seed: &TokenSeed) -> Result<String, AuthError> {
        if seed.session_id.is_empty() {
            return Err(AuthError::Derivation("empty session id".to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(seed.timestamp_ms.to_be_bytes());
        hasher.update(seed.session_id.as_bytes());
        hasher.update(seed.attempt.to_be_bytes());
        if let Some(challenge) = &seed.challenge {
            hasher.update(challenge.as_bytes());
        }

        let mut token = hex::encode(hasher.finalize());
        token.truncate(40);
        Ok(token)
    }
}

/// Extracts `name=value` pairs from `Set-Cookie` header values
fn parse_set_cookies<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<(String, String)> {
    values
        .into_iter()
        .filter_map(|raw| {
            let pair = raw.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Pulls the `arg1` seed out of a challenge page
fn extract_challenge(body: &str) -> Option<String> {
    let start = body.find("arg1=")? + "arg1=".len();
    let rest = body[start..].trim_start_matches(['\'', '"']);
    let value: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    (!value.is_empty()).then_some(value)
}

fn upsert_cookie(cookies: &mut Vec<(String, String)>, name: &str, value: &str) {
    match cookies.iter_mut().find(|(n, _)| n == name) {
        Some(existing) => existing.1 = value.to_string(),
        None => cookies.push((name.to_string(), value.to_string())),
    }
}

/// Refreshes a session over HTTP: handshake, derive, verify
pub struct HttpTokenRefresher<D: AntiBotTokenDeriver = DigestTokenDeriver> {
    client: Client,
    handshake_url: String,
    verify_url: String,
    session_cookie: String,
    anti_bot_cookie: String,
    max_attempts: u32,
    deriver: D,
}

impl HttpTokenRefresher<DigestTokenDeriver> {
    pub fn new(client: Client, api: &ApiConfig, auth: &AuthConfig) -> Self {
        Self::with_deriver(client, api, auth, DigestTokenDeriver)
    }
}

impl<D: AntiBotTokenDeriver> HttpTokenRefresher<D> {
    pub fn with_deriver(client: Client, api: &ApiConfig, auth: &AuthConfig, deriver: D) -> Self {
        let base = api.base_url.trim_end_matches('/');
        Self {
            client,
            handshake_url: format!("{}{}", base, api.handshake_path),
            verify_url: format!("{}{}", base, api.verify_path),
            session_cookie: auth.session_cookie.clone(),
            anti_bot_cookie: auth.anti_bot_cookie.clone(),
            max_attempts: auth.max_token_attempts,
            deriver,
        }
    }

    /// Unauthenticated request that hands out the base session cookie
    async fn handshake(&self) -> Result<(Vec<(String, String)>, Option<String>), AuthError> {
        let response = self
            .client
            .get(&self.handshake_url)
            .send()
            .await
            .map_err(|e| AuthError::Handshake(e.to_string()))?;

        let cookies = parse_set_cookies(
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(error = %e, "Reading handshake body failed");
                String::new()
            }
        };
        let challenge = is_challenge_page(&body)
            .then(|| extract_challenge(&body))
            .flatten();

        Ok((cookies, challenge))
    }

    /// Sends both tokens and reports whether the service accepted them
    ///
    /// `Err` carries the next challenge seed, if the rejection included one.
    async fn verify(&self, cookies: &[(String, String)]) -> Result<(), Option<String>> {
        let response = match self
            .client
            .get(&self.verify_url)
            .header(COOKIE, cookie_header(cookies))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Verification request failed");
                return Err(None);
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(error = %e, "Reading verification body failed");
                String::new()
            }
        };

        if status.is_success() && !is_challenge_page(&body) {
            return Ok(());
        }

        tracing::debug!(status = status.as_u16(), "Verification rejected");
        Err(extract_challenge(&body))
    }
}

#[async_trait]
impl<D: AntiBotTokenDeriver> TokenRefresher for HttpTokenRefresher<D> {
    async fn refresh(&self) -> Result<SessionTokens, AuthError> {
        let (mut cookies, mut challenge) = self.handshake().await?;

        let session_token = cookies
            .iter()
            .find(|(name, _)| name == &self.session_cookie)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| AuthError::MissingSessionCookie(self.session_cookie.clone()))?;

        for attempt in 1..=self.max_attempts {
            let seed = TokenSeed {
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                session_id: session_token.clone(),
                attempt,
                challenge: challenge.clone(),
            };
            let anti_bot_token = self.deriver.derive(&seed)?;
            upsert_cookie(&mut cookies, &self.anti_bot_cookie, &anti_bot_token);

            match self.verify(&cookies).await {
                Ok(()) => {
                    tracing::debug!(attempt, "Anti-bot token accepted");
                    return Ok(SessionTokens {
                        session_token,
                        anti_bot_token,
                        cookies,
                    });
                }
                Err(next) => {
                    tracing::warn!(attempt, max = self.max_attempts, "Anti-bot token rejected");
                    if next.is_some() {
                        challenge = next;
                    }
                }
            }
        }

        Err(AuthError::VerificationFailed {
            attempts: self.max_attempts,
        })
    }
}
