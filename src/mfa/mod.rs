//! MFA verifier (C10) — TOTP (stateless) and SMS (stateful, one-shot).
//!
//! Common `Challenge`/`Verify` interface composed by [`MultiVerifier`]
//! (spec §4.9). Grounded on the teacher's trait-boundary style; the SMS
//! one-shot delete-before-compare discipline is grounded directly on
//! `key_server::store::InMemoryTokenStore`'s remove-then-check pattern.

pub mod sms;
pub mod totp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Which MFA factor issued a given challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Totp,
    Sms,
}

/// An outstanding MFA challenge (spec §3, ephemeral).
#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub method: Method,
    pub target: String,
    pub expires_at: DateTime<Utc>,
}

/// A single MFA factor.
#[async_trait]
pub trait MfaVerifier: Send + Sync {
    /// Issue a challenge for `user`, or `Err(UserNotFound)` if this
    /// verifier variant does not recognize the user.
    async fn challenge(&self, user: &str) -> crate::Result<Challenge>;

    /// Verify a previously issued challenge's code.
    async fn verify(&self, challenge_id: &str, code: &str) -> crate::Result<bool>;
}

/// Composes an ordered list of [`MfaVerifier`]s (spec §4.9, §9).
pub struct MultiVerifier {
    verifiers: Vec<Box<dyn MfaVerifier>>,
}

impl MultiVerifier {
    #[must_use]
    pub fn new(verifiers: Vec<Box<dyn MfaVerifier>>) -> Self {
        Self { verifiers }
    }

    /// `Challenge` returns the first success; if every variant reports
    /// user-not-found, the aggregate does too.
    pub async fn challenge(&self, user: &str) -> crate::Result<Challenge> {
        for verifier in &self.verifiers {
            match verifier.challenge(user).await {
                Ok(challenge) => return Ok(challenge),
                Err(crate::Error::UserNotFound) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(crate::Error::UserNotFound)
    }

    /// `Verify` tries each variant and returns true on the first true.
    pub async fn verify(&self, challenge_id: &str, code: &str) -> crate::Result<bool> {
        let mut last_err = None;
        for verifier in &self.verifiers {
            match verifier.verify(challenge_id, code).await {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(err) => last_err = Some(err),
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }
}
