//! Session management.
//!
//! Validates the stored credential against the remote service, caches a
//! successful validation for a TTL window, tracks consecutive failures and
//! backs off before hitting the verifier again.
//!
//! ## Status resolution
//!
//! ```text
//! no credential            -> Unauthenticated
//! cached, within TTL       -> Authenticated (no network call)
//! inside backoff window    -> last outcome (no network call)
//! verify ok                -> Authenticated, failures reset
//! verify 401/403           -> Unauthenticated, cache dropped
//! verify unreachable       -> Offline if a prior success exists, else Unknown
//! verify timed out         -> Unknown (credential kept)
//! verify other failure     -> Unknown (credential kept)
//! ```

mod validation;

pub use validation::*;

use crate::api::{CredentialSource, CredentialVerifier};
use crate::config::SessionPolicy;
use crate::credentials::{CredentialStore, CREDENTIAL_KEY};
use crate::error::Result;
use crate::retry::with_timeout;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time view of the session for status output.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<VerificationOutcome>,
    pub cached: Option<CachedValidation>,
}

#[derive(Debug, Clone, Copy)]
struct FailureMark {
    at: DateTime<Utc>,
    retry_after: Instant,
}

/// Session manager with TTL-cached validation and failure backoff.
pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    verifier: Arc<dyn CredentialVerifier>,
    policy: SessionPolicy,
    /// Bearer credential shared with outgoing API requests
    credential_source: CredentialSource,
    /// Trusted only inside the TTL window
    cache: RwLock<Option<CachedValidation>>,
    /// Most recent successful validation, kept past the TTL for offline fallback
    last_known_good: RwLock<Option<CachedValidation>>,
    last_outcome: RwLock<Option<VerificationOutcome>>,
    failure_count: AtomicU32,
    last_failure: RwLock<Option<FailureMark>>,
    /// Cancelled on logout; connects in flight observe a child of it
    session_cancel: Mutex<CancellationToken>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        verifier: Arc<dyn CredentialVerifier>,
        policy: SessionPolicy,
        credential_source: CredentialSource,
    ) -> Self {
        if let Ok(Some(credential)) = store.get(CREDENTIAL_KEY) {
            credential_source.set(Some(credential));
        }

        Self {
            store,
            verifier,
            policy,
            credential_source,
            cache: RwLock::new(None),
            last_known_good: RwLock::new(None),
            last_outcome: RwLock::new(None),
            failure_count: AtomicU32::new(0),
            last_failure: RwLock::new(None),
            session_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Verify a credential remotely and update the session bookkeeping.
    pub async fn validate(&self, credential: &str) -> ValidationResult {
        let result = self.verify_remote(credential).await;
        self.record(credential, &result);
        result
    }

    /// One remote verification. Leaves the session untouched.
    async fn verify_remote(&self, credential: &str) -> ValidationResult {
        let method = credential_method(credential).to_string();
        let endpoint = self.verifier.endpoint();

        debug!(method = %method, endpoint = %endpoint, "Verifying credential");
        let outcome = with_timeout(
            self.policy.verify_timeout,
            "credential verification",
            self.verifier.verify(credential),
        )
        .await;

        let (outcome, reason) = match outcome {
            Ok(()) => (VerificationOutcome::Verified, None),
            Err(e) if e.is_auth() => {
                warn!(error = %e, "Credential rejected");
                (VerificationOutcome::Rejected, Some(e.to_string()))
            }
            Err(e) if e.is_timeout() => {
                warn!(error = %e, "Credential verification timed out");
                (VerificationOutcome::TimedOut, Some(e.to_string()))
            }
            Err(e) if e.is_network() => {
                warn!(error = %e, "Verification service unreachable");
                (VerificationOutcome::Unreachable, Some(e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, "Credential verification failed");
                (VerificationOutcome::Failed, Some(e.to_string()))
            }
        };

        ValidationResult {
            valid: outcome == VerificationOutcome::Verified,
            method,
            endpoint,
            outcome,
            reason,
        }
    }

    fn record(&self, credential: &str, result: &ValidationResult) {
        match result.outcome {
            VerificationOutcome::Verified => self.record_success(CachedValidation::new(
                credential,
                result.method.clone(),
                result.endpoint.clone(),
            )),
            VerificationOutcome::Rejected => {
                self.invalidate();
                self.record_failure(VerificationOutcome::Rejected);
            }
            outcome => self.record_failure(outcome),
        }
    }

    /// Resolve the current authentication state, hitting the network only
    /// when the cache is stale and no backoff is pending.
    pub async fn is_authenticated(&self) -> AuthStatus {
        let credential = match self.stored_credential() {
            Ok(Some(c)) => c,
            Ok(None) => {
                return AuthStatus::unauthenticated("No credential stored. Run `mnem auth login`.");
            }
            Err(e) => return AuthStatus::unauthenticated(e.to_string()),
        };

        if self.cached_for(&credential).is_some() {
            debug!("Using cached validation");
            return AuthStatus::authenticated();
        }

        if let Some(remaining) = self.backoff_remaining() {
            debug!(remaining_ms = remaining.as_millis() as u64, "Verification backing off");
            return self.fallback_status(
                &credential,
                format!(
                    "verification backing off, next attempt in {}s",
                    remaining.as_secs().max(1)
                ),
            );
        }

        self.verify_stored(&credential).await
    }

    /// Re-verify the stored credential, ignoring the cache and the backoff window.
    pub async fn refresh(&self) -> AuthStatus {
        match self.stored_credential() {
            Ok(Some(credential)) => self.verify_stored(&credential).await,
            Ok(None) => AuthStatus::unauthenticated("No credential stored. Run `mnem auth login`."),
            Err(e) => AuthStatus::unauthenticated(e.to_string()),
        }
    }

    async fn verify_stored(&self, credential: &str) -> AuthStatus {
        let result = self.validate(credential).await;
        match result.outcome {
            VerificationOutcome::Verified => {
                self.credential_source.set(Some(credential.to_string()));
                AuthStatus::authenticated()
            }
            VerificationOutcome::Rejected => AuthStatus::unauthenticated(
                result.reason.unwrap_or_else(|| "credential rejected".into()),
            ),
            VerificationOutcome::TimedOut => AuthStatus::unknown(
                "verification timed out; credential kept, try again shortly",
            ),
            VerificationOutcome::Failed => AuthStatus::unknown(format!(
                "verification failed: {}",
                result.reason.unwrap_or_default()
            )),
            VerificationOutcome::Unreachable => self.fallback_status(
                credential,
                result
                    .reason
                    .unwrap_or_else(|| "verification service unreachable".into()),
            ),
        }
    }

    /// Status to report when the verifier cannot be consulted. Only a prior
    /// success for this same credential counts as last-known-good.
    fn fallback_status(&self, credential: &str, reason: String) -> AuthStatus {
        match self.last_outcome() {
            Some(VerificationOutcome::Rejected) => {
                return AuthStatus::unauthenticated(
                    "credential rejected; run `mnem auth login` to re-authenticate",
                );
            }
            Some(VerificationOutcome::TimedOut | VerificationOutcome::Failed) => {
                return AuthStatus::unknown(reason);
            }
            _ => {}
        }

        let last_good = read_lock(&self.last_known_good)
            .clone()
            .filter(|good| good.matches(credential));
        match last_good {
            Some(good) if good.valid => AuthStatus::offline(format!(
                "offline: {} (last verified {})",
                reason,
                good.timestamp.to_rfc3339()
            )),
            _ => AuthStatus::unknown(reason),
        }
    }

    /// Validate and persist a new credential. Nothing is stored unless valid,
    /// and a refused candidate leaves the current session as it was.
    pub async fn login(&self, credential: &str) -> Result<ValidationResult> {
        let credential = credential.trim();
        let result = self.verify_remote(credential).await;
        if !result.valid {
            debug!(outcome = ?result.outcome, "Login candidate not accepted");
            return Ok(result);
        }

        self.store.store(CREDENTIAL_KEY, credential)?;
        self.credential_source.set(Some(credential.to_string()));
        self.record(credential, &result);
        info!(method = %result.method, "Logged in");
        Ok(result)
    }

    /// Drop the credential and cancel everything tied to the current session.
    pub fn logout(&self) -> Result<()> {
        self.store.delete(CREDENTIAL_KEY)?;
        self.credential_source.set(None);
        self.invalidate();
        *write_lock(&self.last_known_good) = None;
        *write_lock(&self.last_outcome) = None;
        *write_lock(&self.last_failure) = None;
        self.failure_count.store(0, Ordering::SeqCst);

        let mut token = self
            .session_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        token.cancel();
        *token = CancellationToken::new();

        info!("Logged out");
        Ok(())
    }

    /// Token cancelled when the current session ends.
    pub fn session_token(&self) -> CancellationToken {
        self.session_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .child_token()
    }

    /// Stored credential, if any.
    pub fn stored_credential(&self) -> Result<Option<String>> {
        self.store.get(CREDENTIAL_KEY)
    }

    /// Drop the cached validation so the next check goes remote.
    pub fn invalidate(&self) {
        *write_lock(&self.cache) = None;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Failure Tracking
    // ─────────────────────────────────────────────────────────────────────────

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        (*read_lock(&self.last_failure)).map(|mark| mark.at)
    }

    /// Backoff delay callers should wait after `failures` consecutive failures.
    pub fn compute_delay(&self, failures: u32) -> Duration {
        self.policy.backoff.delay(failures)
    }

    /// Delay for the current failure count; the base delay after a success.
    pub fn current_delay(&self) -> Duration {
        self.compute_delay(self.failure_count())
    }

    fn record_failure(&self, outcome: VerificationOutcome) {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.compute_delay(count);
        *write_lock(&self.last_failure) = Some(FailureMark {
            at: Utc::now(),
            retry_after: Instant::now() + delay,
        });
        *write_lock(&self.last_outcome) = Some(outcome);
        debug!(failure_count = count, delay_ms = delay.as_millis() as u64, "Recorded verification failure");
    }

    fn record_success(&self, cached: CachedValidation) {
        self.failure_count.store(0, Ordering::SeqCst);
        *write_lock(&self.last_failure) = None;
        *write_lock(&self.last_outcome) = Some(VerificationOutcome::Verified);
        *write_lock(&self.last_known_good) = Some(cached.clone());
        *write_lock(&self.cache) = Some(cached);
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        if self.failure_count() == 0 {
            return None;
        }
        let mark = (*read_lock(&self.last_failure))?;
        mark.retry_after.checked_duration_since(Instant::now())
    }

    fn cached_for(&self, credential: &str) -> Option<CachedValidation> {
        let cache = read_lock(&self.cache);
        cache
            .as_ref()
            .filter(|c| c.valid && c.matches(credential))
            .filter(|c| c.checked_at.elapsed() < self.policy.cache_ttl)
            .cloned()
    }

    fn last_outcome(&self) -> Option<VerificationOutcome> {
        *read_lock(&self.last_outcome)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            failure_count: self.failure_count(),
            last_failure_at: self.last_failure_at(),
            last_outcome: self.last_outcome(),
            cached: read_lock(&self.cache).clone(),
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::error::Error;
    use crate::retry::BackoffPolicy;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// What the fake verifier should do on one call.
    enum Reply {
        Accept,
        Reject,
        Refuse,
        Hang,
        Garble,
    }

    struct ScriptedVerifier {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicU32,
    }

    impl ScriptedVerifier {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialVerifier for ScriptedVerifier {
        async fn verify(&self, _credential: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Accept);
            match reply {
                Reply::Accept => Ok(()),
                Reply::Reject => Err(Error::Auth("revoked (HTTP 401)".into())),
                Reply::Refuse => Err(Error::Network("connection refused".into())),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
                Reply::Garble => Err(Error::Serialization("error decoding response body".into())),
            }
        }

        fn endpoint(&self) -> String {
            "http://verify.test/api/v1/auth/verify".into()
        }
    }

    fn policy(ttl: Duration) -> SessionPolicy {
        SessionPolicy {
            cache_ttl: ttl,
            verify_timeout: Duration::from_millis(50),
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10))
                .with_jitter(Duration::from_millis(10)),
        }
    }

    fn manager(verifier: Arc<ScriptedVerifier>, ttl: Duration) -> SessionManager {
        SessionManager::new(
            Arc::new(MemoryCredentialStore::with_value(CREDENTIAL_KEY, "sk_live_1")),
            verifier,
            policy(ttl),
            CredentialSource::default(),
        )
    }

    #[tokio::test]
    async fn test_cached_within_ttl_skips_network() {
        let verifier = ScriptedVerifier::new(vec![Reply::Accept]);
        let session = manager(verifier.clone(), Duration::from_secs(300));

        assert!(session.is_authenticated().await.authenticated);
        assert!(session.is_authenticated().await.authenticated);
        assert_eq!(verifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_ttl_reverifies() {
        let verifier = ScriptedVerifier::new(vec![Reply::Accept, Reply::Accept]);
        let session = manager(verifier.clone(), Duration::from_millis(20));

        assert!(session.is_authenticated().await.authenticated);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(session.is_authenticated().await.authenticated);
        assert_eq!(verifier.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejection_invalidates_immediately() {
        let verifier = ScriptedVerifier::new(vec![Reply::Accept, Reply::Reject]);
        let session = manager(verifier.clone(), Duration::from_secs(300));

        assert!(session.is_authenticated().await.authenticated);
        let status = session.refresh().await;

        assert!(!status.authenticated);
        assert!(status.needs_login());
        assert!(session.snapshot().cached.is_none());
        assert_eq!(session.failure_count(), 1);

        // Inside the backoff window the rejection sticks without another call
        let status = session.is_authenticated().await;
        assert!(status.needs_login());
        assert_eq!(verifier.calls(), 2);
    }

    #[tokio::test]
    async fn test_network_failure_falls_back_to_last_known_good() {
        let verifier = ScriptedVerifier::new(vec![Reply::Accept, Reply::Refuse]);
        let session = manager(verifier.clone(), Duration::ZERO);

        assert!(session.is_authenticated().await.authenticated);
        let status = session.is_authenticated().await;

        assert!(status.authenticated);
        assert_eq!(status.state, AuthState::Offline);
        assert_eq!(session.failure_count(), 1);
        assert!(session.last_failure_at().is_some());
    }

    #[tokio::test]
    async fn test_network_failure_without_history_is_not_authenticated() {
        let verifier = ScriptedVerifier::new(vec![Reply::Refuse]);
        let session = manager(verifier, Duration::from_secs(300));

        let status = session.is_authenticated().await;
        assert!(!status.authenticated);
        assert_eq!(status.state, AuthState::Unknown);
    }

    #[tokio::test]
    async fn test_timeout_is_unknown_and_keeps_credential() {
        let verifier = ScriptedVerifier::new(vec![Reply::Accept, Reply::Hang]);
        let session = manager(verifier, Duration::ZERO);

        assert!(session.is_authenticated().await.authenticated);
        let status = session.is_authenticated().await;

        assert!(!status.authenticated);
        assert_eq!(status.state, AuthState::Unknown);
        assert!(!status.needs_login());
        assert_eq!(session.stored_credential().unwrap().as_deref(), Some("sk_live_1"));
    }

    #[tokio::test]
    async fn test_failure_count_resets_on_success() {
        let verifier = ScriptedVerifier::new(vec![Reply::Refuse, Reply::Refuse, Reply::Refuse, Reply::Accept]);
        let session = manager(verifier, Duration::from_secs(300));

        for _ in 0..3 {
            let result = session.validate("sk_live_1").await;
            assert!(!result.valid);
            assert_eq!(result.outcome, VerificationOutcome::Unreachable);
        }
        assert_eq!(session.failure_count(), 3);

        // base 100ms * 2^3 = 800ms, jitter 10ms
        let delay = session.current_delay();
        assert!(delay >= Duration::from_millis(790) && delay <= Duration::from_millis(810));

        let result = session.validate("sk_live_1").await;
        assert!(result.valid);
        assert_eq!(result.method, "api_key");
        assert_eq!(session.failure_count(), 0);
        assert!(session.last_failure_at().is_none());

        let base = session.current_delay();
        assert!(base >= Duration::from_millis(90) && base <= Duration::from_millis(110));
    }

    #[test]
    fn test_compute_delay_monotone_until_cap() {
        let verifier = ScriptedVerifier::new(vec![]);
        let mut p = policy(Duration::ZERO);
        p.backoff = p.backoff.with_jitter(Duration::ZERO);
        let session = SessionManager::new(
            Arc::new(MemoryCredentialStore::new()),
            verifier,
            p,
            CredentialSource::default(),
        );

        let mut previous = Duration::ZERO;
        for n in 0..20 {
            let d = session.compute_delay(n);
            assert!(d >= previous);
            assert!(d <= Duration::from_secs(10));
            previous = d;
        }
        assert_eq!(session.compute_delay(19), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_all_counted() {
        let verifier = ScriptedVerifier::new((0..40).map(|_| Reply::Refuse).collect());
        let session = Arc::new(manager(verifier, Duration::from_secs(300)));

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let s = session.clone();
                tokio::spawn(async move { s.validate("sk_live_1").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(session.failure_count(), 40);
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let verifier = ScriptedVerifier::new(vec![Reply::Reject, Reply::Accept]);
        let source = CredentialSource::default();
        let session = SessionManager::new(
            Arc::new(MemoryCredentialStore::new()),
            verifier,
            policy(Duration::from_secs(300)),
            source.clone(),
        );

        let rejected = session.login("sk_bad").await.unwrap();
        assert!(!rejected.valid);
        assert!(session.stored_credential().unwrap().is_none());

        let accepted = session.login("sk_good").await.unwrap();
        assert!(accepted.valid);
        assert_eq!(session.stored_credential().unwrap().as_deref(), Some("sk_good"));
        assert_eq!(source.get().as_deref(), Some("sk_good"));

        let token = session.session_token();
        session.logout().unwrap();
        assert!(token.is_cancelled());
        assert!(!session.session_token().is_cancelled());
        assert!(source.get().is_none());
        assert!(session.is_authenticated().await.needs_login());
    }
    #[tokio::test]
    async fn test_unusable_reply_is_unknown_not_offline() {
        let verifier = ScriptedVerifier::new(vec![Reply::Accept, Reply::Garble]);
        let session = manager(verifier, Duration::ZERO);

        assert!(session.is_authenticated().await.authenticated);
        let result = session.validate("sk_live_1").await;
        assert!(!result.valid);
        assert_eq!(result.outcome, VerificationOutcome::Failed);

        let status = session.is_authenticated().await;
        assert!(!status.authenticated);
        assert_eq!(status.state, AuthState::Unknown);
        assert!(!status.needs_login());
    }

    #[tokio::test]
    async fn test_rejected_login_keeps_current_session() {
        let verifier = ScriptedVerifier::new(vec![Reply::Accept, Reply::Reject]);
        let source = CredentialSource::default();
        let session = SessionManager::new(
            Arc::new(MemoryCredentialStore::with_value(CREDENTIAL_KEY, "sk_good")),
            verifier.clone(),
            policy(Duration::from_secs(300)),
            source.clone(),
        );
        assert!(session.is_authenticated().await.authenticated);

        let rejected = session.login("sk_typo").await.unwrap();
        assert!(!rejected.valid);
        assert_eq!(rejected.outcome, VerificationOutcome::Rejected);

        assert_eq!(session.stored_credential().unwrap().as_deref(), Some("sk_good"));
        assert_eq!(source.get().as_deref(), Some("sk_good"));
        assert_eq!(session.failure_count(), 0);
        assert!(session.snapshot().cached.is_some());

        let status = session.is_authenticated().await;
        assert_eq!(status.state, AuthState::Authenticated);
        assert_eq!(verifier.calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_fallback_requires_same_credential() {
        let verifier = ScriptedVerifier::new(vec![Reply::Accept, Reply::Refuse]);
        let store = Arc::new(MemoryCredentialStore::with_value(CREDENTIAL_KEY, "sk_live_1"));
        let session = SessionManager::new(
            store.clone(),
            verifier,
            policy(Duration::ZERO),
            CredentialSource::default(),
        );
        assert!(session.is_authenticated().await.authenticated);

        // Credential replaced behind the running session
        store.store(CREDENTIAL_KEY, "sk_unverified").unwrap();
        let status = session.is_authenticated().await;

        assert!(!status.authenticated);
        assert_eq!(status.state, AuthState::Unknown);
    }
}
