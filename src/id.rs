//! Identifier & clock utilities (C1).
//!
//! All Sentinel identifiers (request id, break-glass id, session id,
//! challenge id) are 16 lowercase-hex characters — 8 bytes drawn from the
//! process CSPRNG (spec §3). Grounded on the teacher's `InMemoryTokenStore`
//! id generation (`generate_bearer`/`generate_jti`, `rand::rng().random()`),
//! adapted to the hex format this spec requires instead of the teacher's
//! base64/UUID forms.

use chrono::{DateTime, Utc};
use rand::RngCore;

/// Number of random bytes backing a Sentinel identifier (8 bytes = 16 hex chars).
const ID_BYTES: usize = 8;

/// Generate a new 16-character lowercase-hex identifier from the process CSPRNG.
#[must_use]
pub fn generate() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Validate that `id` matches `^[0-9a-f]{16}$`.
#[must_use]
pub fn is_valid(id: &str) -> bool {
    id.len() == ID_BYTES * 2 && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Validate an identifier, returning a crate [`crate::Error::InvalidId`] on failure.
pub fn validate(id: &str) -> crate::Result<()> {
    if is_valid(id) {
        Ok(())
    } else {
        Err(crate::Error::InvalidId(id.to_string()))
    }
}

/// The current UTC instant. A thin wrapper so call sites depend on this
/// module rather than `chrono::Utc::now()` directly, keeping the clock
/// mockable in tests that construct fixed instants instead of calling this.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp as RFC3339 with nanosecond precision, the wire format
/// spec §3 and §6 require for every durable entity and audit-log envelope.
#[must_use]
pub fn to_rfc3339_nanos(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
