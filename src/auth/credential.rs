use crate::auth::{AuthError, SessionTokens, TokenRefresher};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// A verified session: handshake cookies plus the anti-bot token
#[derive(Clone)]
pub struct Credential {
    pub session_token: String,
    pub anti_bot_token: String,
    /// Every cookie to send, including both tokens
    pub cookies: Vec<(String, String)>,
    pub issued_at: Instant,
    pub ttl: Duration,
    /// Increases with every refresh; identifies which credential a caller saw
    pub generation: u64,
}

impl Credential {
    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    /// Returns true while the credential may still be used
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at()
    }

    /// Value of the `Cookie` request header
    pub fn cookie_header(&self) -> String {
        cookie_header(&self.cookies)
    }
}

/// Joins name/value pairs into a `Cookie` header value
pub(crate) fn cookie_header(cookies: &[(String, String)]) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Shows only a prefix of each token
fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}…", prefix)
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("session_token", &redact(&self.session_token))
            .field("anti_bot_token", &redact(&self.anti_bot_token))
            .field("ttl", &self.ttl)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Outcome of the most recent refresh, shared with callers that queued behind it
#[derive(Default)]
struct RefreshState {
    epoch: u64,
    failure: Option<AuthError>,
}

/// Owns the process-wide credential and refreshes it on demand
///
/// Refreshes are single-flight: callers that find the credential expired
/// queue on one lock, the first runs the refresh, and the rest reuse its
/// result (success or failure) instead of starting their own.
pub struct CredentialStore {
    refresher: Arc<dyn TokenRefresher>,
    ttl: Duration,
    current: RwLock<Option<Credential>>,
    refresh_state: Mutex<RefreshState>,
    refreshes: AtomicU64,
}

impl CredentialStore {
    pub fn new(refresher: Arc<dyn TokenRefresher>, ttl: Duration) -> Self {
        Self {
            refresher,
            ttl,
            current: RwLock::new(None),
            refresh_state: Mutex::new(RefreshState::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    async fn cached(&self) -> Option<Credential> {
        let guard = self.current.read().await;
        guard.as_ref().filter(|c| c.is_valid()).cloned()
    }

    /// Returns the cached credential, refreshing it first if absent or expired
    ///
    /// # Errors
    ///
    /// Returns the refresher's `AuthError` when no credential can be obtained.
    /// Callers that waited on a failed refresh get the same error without a
    /// second attempt.
    pub async fn get_valid_credential(&self) -> Result<Credential, AuthError> {
        if let Some(credential) = self.cached().await {
            return Ok(credential);
        }

        let epoch_seen = self.refreshes.load(Ordering::SeqCst);
        let mut state = self.refresh_state.lock().await;

        // Someone else may have refreshed while we waited for the lock
        if let Some(credential) = self.cached().await {
            return Ok(credential);
        }
        if state.epoch > epoch_seen {
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
        }

        let epoch = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(refresh = epoch, "Refreshing session credential");

        match self.refresher.refresh().await {
            Ok(tokens) => {
                let credential = self.issue(tokens, epoch);
                *self.current.write().await = Some(credential.clone());
                state.epoch = epoch;
                state.failure = None;
                tracing::info!(
                    generation = credential.generation,
                    ttl_secs = credential.ttl.as_secs(),
                    "Session credential refreshed"
                );
                Ok(credential)
            }
            Err(e) => {
                tracing::error!(error = %e, "Credential refresh failed");
                state.epoch = epoch;
                state.failure = Some(e.clone());
                Err(e)
            }
        }
    }

    fn issue(&self, tokens: SessionTokens, generation: u64) -> Credential {
        Credential {
            session_token: tokens.session_token,
            anti_bot_token: tokens.anti_bot_token,
            cookies: tokens.cookies,
            issued_at: Instant::now(),
            ttl: self.ttl,
            generation,
        }
    }

    /// Discards `stale` if it is still the cached credential
    ///
    /// Workers rejected with the same stale credential all call this; only
    /// the first clears it, so they converge on a single refresh.
    pub async fn invalidate(&self, stale: &Credential) {
        let mut guard = self.current.write().await;
        if guard
            .as_ref()
            .is_some_and(|c| c.generation == stale.generation)
        {
            tracing::debug!(generation = stale.generation, "Invalidating credential");
            *guard = None;
        }
    }

    /// Discards whatever credential is cached
    pub async fn clear(&self) {
        *self.current.write().await = None;
    }

    /// Number of refresh sequences started so far
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }
}
