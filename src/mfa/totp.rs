//! TOTP (RFC 6238) MFA variant — stateless, HMAC-SHA1, 30-second step.
//!
//! No teacher precedent exists for one-time-code generation; this module
//! is new code written in the surrounding codebase's idiom (narrow
//! `thiserror`-free trait impl, `hmac`/`sha1` sitting next to the
//! teacher's own `hmac`/`sha2` dependencies).

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::{Challenge, MfaVerifier, Method};

type HmacSha1 = Hmac<Sha1>;

const STEP_SECONDS: i64 = 30;

/// Stateless TOTP verifier: `challenge_id` carries the user id directly
/// (spec §4.9), so `Challenge` performs no storage — it only validates
/// that `user` has an enrolled secret.
pub struct TotpVerifier {
    secrets: HashMap<String, Vec<u8>>,
    digits: u32,
    skew_steps: i64,
}

impl TotpVerifier {
    #[must_use]
    pub fn new(secrets: HashMap<String, Vec<u8>>, digits: u32, skew_steps: i64) -> Self {
        Self {
            secrets,
            digits,
            skew_steps,
        }
    }

    fn code_at_counter(secret: &[u8], counter: u64, digits: u32) -> String {
        let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&counter.to_be_bytes());
        let hmac_result = mac.finalize().into_bytes();

        let offset = (hmac_result[hmac_result.len() - 1] & 0x0f) as usize;
        let binary = ((u32::from(hmac_result[offset]) & 0x7f) << 24)
            | (u32::from(hmac_result[offset + 1]) << 16)
            | (u32::from(hmac_result[offset + 2]) << 8)
            | u32::from(hmac_result[offset + 3]);

        let modulus = 10u32.pow(digits);
        format!("{:0width$}", binary % modulus, width = digits as usize)
    }

    fn counter_for(instant: chrono::DateTime<chrono::Utc>) -> u64 {
        (instant.timestamp() / STEP_SECONDS).max(0) as u64
    }
}

#[async_trait]
impl MfaVerifier for TotpVerifier {
    async fn challenge(&self, user: &str) -> crate::Result<Challenge> {
        if !self.secrets.contains_key(user) {
            return Err(crate::Error::UserNotFound);
        }
        Ok(Challenge {
            id: user.to_string(),
            method: Method::Totp,
            target: String::new(),
            // TOTP has no expiring server-side record; this mirrors the
            // generator's own 30-second step so callers display a sane TTL.
            expires_at: crate::id::now() + chrono::Duration::seconds(STEP_SECONDS),
        })
    }

    /// `challenge_id` is the user id (stateless). Iterates counters in
    /// `[counter - skew, counter + skew]`; any match returns true.
    async fn verify(&self, challenge_id: &str, code: &str) -> crate::Result<bool> {
        let Some(secret) = self.secrets.get(challenge_id) else {
            return Err(crate::Error::ChallengeNotFound);
        };
        let counter = Self::counter_for(crate::id::now());
        for delta in -self.skew_steps..=self.skew_steps {
            let candidate_counter = (counter as i64 + delta).max(0) as u64;
            let candidate = Self::code_at_counter(secret, candidate_counter, self.digits);
            if subtle::ConstantTimeEq::ct_eq(candidate.as_bytes(), code.as_bytes()).into() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
