//! SMS MFA variant — stateful, one-shot.
//!
//! Grounded directly on the teacher's `key_server::store::InMemoryTokenStore`:
//! a `DashMap`-backed table with a delete-then-check access pattern. Here
//! the delete happens *unconditionally* before the comparison, per spec
//! §4.9 ("one-shot + no-oracle").

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;

use super::{Challenge, MfaVerifier, Method};
use crate::id;

const CODE_DIGITS: u32 = 6;
const CHALLENGE_TTL_MINUTES: i64 = 5;

struct StoredChallenge {
    code: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// Sends a one-time code to `target` (the masked phone number). Out-of-scope
/// external collaborator per spec §1; a production deployment plugs a real
/// SMS gateway in behind this trait.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, target: &str, code: &str) -> crate::Result<()>;
}

/// An in-memory [`SmsTransport`] recording sent codes, for tests.
#[derive(Default)]
pub struct RecordingSmsTransport {
    sent: parking_lot::Mutex<Vec<(String, String)>>,
}

impl RecordingSmsTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SmsTransport for RecordingSmsTransport {
    async fn send(&self, target: &str, code: &str) -> crate::Result<()> {
        self.sent.lock().push((target.to_string(), code.to_string()));
        Ok(())
    }
}

/// Stateful SMS verifier: one challenge map, delete-before-compare on
/// every verification attempt.
pub struct SmsVerifier<T: SmsTransport> {
    targets: std::collections::HashMap<String, String>,
    challenges: DashMap<String, StoredChallenge>,
    transport: T,
}

impl<T: SmsTransport> SmsVerifier<T> {
    #[must_use]
    pub fn new(targets: std::collections::HashMap<String, String>, transport: T) -> Self {
        Self {
            targets,
            challenges: DashMap::new(),
            transport,
        }
    }

    fn generate_code() -> String {
        let n: u32 = rand::rng().random_range(0..10u32.pow(CODE_DIGITS));
        format!("{:0width$}", n, width = CODE_DIGITS as usize)
    }
}

#[async_trait]
impl<T: SmsTransport> MfaVerifier for SmsVerifier<T> {
    async fn challenge(&self, user: &str) -> crate::Result<Challenge> {
        let Some(target) = self.targets.get(user) else {
            return Err(crate::Error::UserNotFound);
        };
        let code = Self::generate_code();
        let id = id::generate();
        let expires_at = id::now() + chrono::Duration::minutes(CHALLENGE_TTL_MINUTES);
        self.challenges.insert(id.clone(), StoredChallenge { code: code.clone(), expires_at });
        self.transport.send(target, &code).await?;
        Ok(Challenge {
            id,
            method: Method::Sms,
            target: mask(target),
            expires_at,
        })
    }

    /// Deletes the record unconditionally before comparing (one-shot,
    /// no-oracle). Expired challenge -> `Ok(false)`, not an error; unknown
    /// challenge -> `Err(ChallengeNotFound)` (spec §4.9).
    async fn verify(&self, challenge_id: &str, code: &str) -> crate::Result<bool> {
        let Some((_, stored)) = self.challenges.remove(challenge_id) else {
            return Err(crate::Error::ChallengeNotFound);
        };
        if id::now() >= stored.expires_at {
            return Ok(false);
        }
        Ok(subtle::ConstantTimeEq::ct_eq(stored.code.as_bytes(), code.as_bytes()).into())
    }
}

fn mask(phone: &str) -> String {
    let visible = phone.chars().rev().take(2).collect::<Vec<_>>();
    let visible: String = visible.into_iter().rev().collect();
    format!("***-***-{visible}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn verifier() -> (std::sync::Arc<RecordingSmsTransport>, SmsVerifier<TransportHandle>) {
        let transport = std::sync::Arc::new(RecordingSmsTransport::new());
        let handle = TransportHandle(transport.clone());
        let targets: HashMap<String, String> = [("alice".to_string(), "+15551234567".to_string())].into_iter().collect();
        (transport, SmsVerifier::new(targets, handle))
    }

    struct TransportHandle(std::sync::Arc<RecordingSmsTransport>);

    #[async_trait]
    impl SmsTransport for TransportHandle {
        async fn send(&self, target: &str, code: &str) -> crate::Result<()> {
            self.0.send(target, code).await
        }
    }

    #[tokio::test]
    async fn challenge_dispatches_code_via_transport() {
        let (transport, verifier) = verifier();
        let challenge = verifier.challenge("alice").await.unwrap();
        assert_eq!(challenge.method, Method::Sms);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn verify_succeeds_exactly_once() {
        let (transport, verifier) = verifier();
        let challenge = verifier.challenge("alice").await.unwrap();
        let code = transport.sent()[0].1.clone();

        assert!(verifier.verify(&challenge.id, &code).await.unwrap());
        // Second attempt with the same id: one-shot, already deleted.
        let err = verifier.verify(&challenge.id, &code).await.unwrap_err();
        assert!(matches!(err, crate::Error::ChallengeNotFound));
    }

    #[tokio::test]
    async fn verify_rejects_wrong_code_but_still_consumes_challenge() {
        let (transport, verifier) = verifier();
        let challenge = verifier.challenge("alice").await.unwrap();
        let _ = transport.sent();

        assert!(!verifier.verify(&challenge.id, "000000").await.unwrap());
        let err = verifier.verify(&challenge.id, "000000").await.unwrap_err();
        assert!(matches!(err, crate::Error::ChallengeNotFound));
    }

    #[tokio::test]
    async fn challenge_rejects_unenrolled_user() {
        let (_transport, verifier) = verifier();
        let err = verifier.challenge("bob").await.unwrap_err();
        assert!(matches!(err, crate::Error::UserNotFound));
    }
}
