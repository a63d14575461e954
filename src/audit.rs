//! Audit logger (C8) — append-only, HMAC-signed structured log.
//!
//! Grounded on the teacher's `key_server::audit`: a serializable event
//! struct emitted via `tracing::info!(audit = %json, ...)`. Generalized
//! with the canonical-JSON + `HMAC-SHA256` signing and monotonic replay
//! counters spec §4.7 requires, since Sentinel's audit trail must outlive
//! log-verbosity filtering and be independently tamper-checkable.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::id;

type HmacSha256 = Hmac<Sha256>;

/// The three audit record kinds spec §4.7 defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Decision,
    Approval,
    BreakGlass,
}

/// Severity tag surfaced for operators filtering high-priority entries
/// (e.g. policy tamper detection, spec §4.12 "high-severity audit entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    High,
}

/// The common envelope shared by every audit record (spec §4.7).
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub timestamp: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub actor: String,
    pub profile: String,
    pub correlation_id: String,
    pub key_id: String,
    pub sequence: u64,
    pub payload: serde_json::Value,
}

/// A KMS-wrapped HMAC key boundary: production deployments provision the
/// raw key out-of-band and plug a real unwrap implementation in here; the
/// core only ever sees the unwrapped bytes plus a `key_id` for rotation
/// tracking (spec §4.7 "provisioned out-of-band (KMS-wrapped)").
pub trait KeyProvider: Send + Sync {
    fn key_id(&self) -> &str;
    fn key_bytes(&self) -> &[u8];
}

/// A fixed, already-unwrapped key — the reference [`KeyProvider`] used by
/// tests and local/dev deployments.
pub struct StaticKey {
    key_id: String,
    bytes: Vec<u8>,
}

impl StaticKey {
    #[must_use]
    pub fn new(key_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            key_id: key_id.into(),
            bytes,
        }
    }
}

impl KeyProvider for StaticKey {
    fn key_id(&self) -> &str {
        &self.key_id
    }
    fn key_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Append-only audit logger. Signs every emitted line with
/// `HMAC-SHA256(hmac_key, canonical_bytes)` and stamps a monotonic
/// per-stream sequence number for replay detection.
pub struct AuditLogger<K: KeyProvider> {
    key: K,
    sequence: AtomicU64,
}

impl<K: KeyProvider> AuditLogger<K> {
    #[must_use]
    pub fn new(key: K) -> Self {
        Self {
            key,
            sequence: AtomicU64::new(0),
        }
    }

    /// Emit `event_type`/`actor`/`profile`/`correlation_id` with `payload`,
    /// signing and writing one JSON line via `tracing::info!` (mirroring
    /// the teacher's `audit::emit`) and returning the signed line so a
    /// caller wiring a dedicated file/forwarder sink can also persist it.
    pub fn log(
        &self,
        event_type: EventType,
        severity: Severity,
        actor: &str,
        profile: &str,
        correlation_id: &str,
        payload: serde_json::Value,
    ) -> crate::Result<String> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            timestamp: id::to_rfc3339_nanos(id::now()),
            event_type,
            severity,
            actor: actor.to_string(),
            profile: profile.to_string(),
            correlation_id: correlation_id.to_string(),
            key_id: self.key.key_id().to_string(),
            sequence,
            payload,
        };
        let line = sign_line(&envelope, self.key.key_bytes())?;
        tracing::info!(audit = %line, "sentinel audit");
        Ok(line)
    }
}

/// Marshal `envelope` to canonical JSON (keys sorted, via `serde_json`'s
/// `BTreeMap`-backed `Value` representation), compute the HMAC, and append
/// it as a `sig` field (spec §4.7, §6 "audit log line").
fn sign_line(envelope: &Envelope, key: &[u8]) -> crate::Result<String> {
    let mut value = serde_json::to_value(envelope)?;
    let canonical = canonicalize(&value)?;

    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| crate::Error::Internal(e.to_string()))?;
    mac.update(canonical.as_bytes());
    let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    let object = value.as_object_mut().expect("envelope serializes to an object");
    object.insert("sig".to_string(), serde_json::Value::String(sig));
    Ok(serde_json::to_string(&canonicalize_value(value))?)
}

/// Recompute the canonical-JSON signature over every field except `sig`
/// and compare against the stored `sig`. Used by audit verification tools
/// and by tamper-detection tests.
pub fn verify_line(line: &str, key: &[u8]) -> crate::Result<bool> {
    let mut value: serde_json::Value = serde_json::from_str(line)?;
    let object = value.as_object_mut().ok_or_else(|| crate::Error::Internal("audit line is not a JSON object".to_string()))?;
    let Some(serde_json::Value::String(claimed_sig)) = object.remove("sig") else {
        return Ok(false);
    };
    let canonical = canonicalize(&value)?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| crate::Error::Internal(e.to_string()))?;
    mac.update(canonical.as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    Ok(subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), claimed_sig.as_bytes()).into())
}

fn canonicalize(value: &serde_json::Value) -> crate::Result<String> {
    Ok(serde_json::to_string(&canonicalize_value(value.clone()))?)
}

/// Recursively rewrite a [`serde_json::Value`] so every object's keys sort
/// lexicographically on serialization (`serde_json`'s default `Map` is
/// insertion-ordered unless the `preserve_order` feature is absent, in
/// which case it's already a `BTreeMap`; this is defensive either way).
fn canonicalize_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (k, v) in entries {
                sorted.insert(k, canonicalize_value(v));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.into_iter().map(canonicalize_value).collect()),
        other => other,
    }
}
