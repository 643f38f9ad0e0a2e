//! Validation results and authentication status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

/// How a verification call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// Remote accepted the credential
    Verified,
    /// Remote explicitly rejected it (401/403)
    Rejected,
    /// Remote could not be reached
    Unreachable,
    /// No answer within the deadline
    TimedOut,
    /// Remote answered, but not with an accept or a rejection
    Failed,
}

/// Result of validating one credential.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub method: String,
    pub endpoint: String,
    pub outcome: VerificationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Coarse authentication state reported to the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// Verified (possibly from cache)
    Authenticated,
    /// Remote unreachable; running on the last successful verification
    Offline,
    /// Verification outcome unknown (timeout or no prior success)
    Unknown,
    /// No credential, or credential rejected
    Unauthenticated,
}

/// Answer to "am I logged in?".
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub state: AuthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthStatus {
    pub fn authenticated() -> Self {
        Self {
            authenticated: true,
            state: AuthState::Authenticated,
            reason: None,
        }
    }

    pub fn offline(reason: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            state: AuthState::Offline,
            reason: Some(reason.into()),
        }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            state: AuthState::Unknown,
            reason: Some(reason.into()),
        }
    }

    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            state: AuthState::Unauthenticated,
            reason: Some(reason.into()),
        }
    }

    /// True when the user has to log in again.
    pub fn needs_login(&self) -> bool {
        self.state == AuthState::Unauthenticated
    }
}

/// A successful verification kept for the TTL window.
#[derive(Debug, Clone)]
pub struct CachedValidation {
    pub valid: bool,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub endpoint: String,
    pub(crate) checked_at: Instant,
    pub(crate) fingerprint: u64,
}

impl CachedValidation {
    pub(crate) fn new(credential: &str, method: String, endpoint: String) -> Self {
        Self {
            valid: true,
            timestamp: Utc::now(),
            method,
            endpoint,
            checked_at: Instant::now(),
            fingerprint: fingerprint(credential),
        }
    }

    pub(crate) fn matches(&self, credential: &str) -> bool {
        self.fingerprint == fingerprint(credential)
    }
}

/// Non-reversible tag so the cache never holds the raw credential.
pub(crate) fn fingerprint(credential: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    credential.hash(&mut hasher);
    hasher.finish()
}

/// Describe the credential kind from its shape.
pub fn credential_method(credential: &str) -> &'static str {
    let trimmed = credential.trim();
    if ["pk_", "sk_", "mnem_"].iter().any(|p| trimmed.starts_with(p)) {
        "api_key"
    } else if trimmed.split('.').count() == 3 {
        "bearer"
    } else {
        "token"
    }
}
