//! Session and anti-bot token lifecycle
//!
//! The remote service only answers requests that carry a session cookie from
//! an initial handshake plus a short-lived anti-bot token derived from it.
//! This module keeps one such credential per process:
//! - `CredentialStore`: caches the credential, refreshes it on expiry, and
//!   guarantees concurrent callers share a single refresh
//! - `TokenRefresher`: obtains a fresh session (handshake, derive, verify)
//! - `AntiBotTokenDeriver`: the replaceable token algorithm

mod credential;
mod refresher;

pub use credential::{Credential, CredentialStore};
pub use refresher::{
    AntiBotTokenDeriver, DigestTokenDeriver, HttpTokenRefresher, SessionTokens, TokenRefresher,
    TokenSeed,
};

use thiserror::Error;

/// Errors raised while obtaining a credential
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Handshake request failed: {0}")]
    Handshake(String),

    #[error("Handshake response carried no {0} cookie")]
    MissingSessionCookie(String),

    #[error("Anti-bot token derivation failed: {0}")]
    Derivation(String),

    #[error("Verification rejected {attempts} distinct tokens")]
    VerificationFailed { attempts: u32 },

    #[error("Freshly refreshed credential was rejected")]
    RejectedAfterRefresh,
}

/// Returns true if `body` is the anti-bot challenge page instead of data
///
/// The service answers unauthenticated or stale requests with a small HTML
/// page that sets `acw_sc__v2` from a script seeded by `arg1`.
pub fn is_challenge_page(body: &str) -> bool {
    let head = body.trim_start();
    let looks_like_html = head.starts_with('<');
    looks_like_html && (body.contains("acw_sc__v2") || body.contains("arg1="))
}
