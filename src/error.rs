//! Crate-wide error taxonomy.
//!
//! Every sentinel error is a distinct, composable variant of [`Error`].
//! Component modules define narrower `thiserror` enums (`MfaError`,
//! `StoreError`, ...) and convert into this enum only at the boundary where
//! the orchestrator or an HTTP handler needs a single type to match on —
//! mirrored on the teacher's `OidcError` → `crate::Error` boundary in
//! `key_server/handler.rs`.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level Sentinel error taxonomy (spec §7).
#[derive(Error, Debug)]
pub enum Error {
    // ── Input ──────────────────────────────────────────────────────────
    /// An identifier did not match `^[0-9a-f]{16}$`.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A policy document failed structural validation.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// A rule's time window was malformed (bad hour range, unknown timezone).
    #[error("invalid time window: {0}")]
    InvalidTimeWindow(String),

    // ── Not found ──────────────────────────────────────────────────────
    /// No policy blob exists at the configured key.
    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    /// No approval request exists with this id.
    #[error("approval request not found: {0}")]
    RequestNotFound(String),

    /// No break-glass event exists with this id.
    #[error("break-glass event not found: {0}")]
    EventNotFound(String),

    /// No server session exists with this id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    // ── Conflict ───────────────────────────────────────────────────────
    /// An approval request with this id already exists.
    #[error("approval request already exists: {0}")]
    RequestExists(String),

    /// A break-glass event with this id already exists.
    #[error("break-glass event already exists: {0}")]
    EventExists(String),

    /// A server session with this id already exists.
    #[error("session already exists: {0}")]
    SessionExists(String),

    /// An optimistic-lock `Update` lost the race against a concurrent writer.
    #[error("concurrent modification")]
    ConcurrentModification,

    /// `Revoke` was called on a session already in the `revoked` state.
    #[error("session already revoked: {0}")]
    SessionAlreadyRevoked(String),

    /// `Revoke` was called on a session already in the `expired` state.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Break-glass activation attempted while an active event already
    /// exists for the same `(invoker, profile)` pair.
    #[error("active break-glass event already exists for this invoker/profile")]
    ActiveEventAlreadyExists,

    // ── Policy load ────────────────────────────────────────────────────
    /// The policy blob had no accompanying detached signature.
    #[error("policy is unsigned")]
    PolicyUnsigned,

    /// The detached signature did not verify against the configured public key.
    #[error("policy signature verification failed")]
    PolicyTampered,

    /// The remote policy source could not be reached (retriable).
    #[error("policy source unavailable: {0}")]
    PolicyUnavailable(String),

    // ── Auth / MFA ─────────────────────────────────────────────────────
    /// No MFA variant recognizes this user.
    #[error("user not recognized by any MFA method")]
    UserNotFound,

    /// The MFA challenge id does not exist (already consumed, or never issued).
    #[error("MFA challenge not found")]
    ChallengeNotFound,

    /// The MFA challenge existed but its `expires_at` has passed.
    #[error("MFA challenge expired")]
    ChallengeExpired,

    /// The supplied MFA code did not match.
    #[error("invalid MFA code")]
    InvalidCode,

    // ── Rate limit ─────────────────────────────────────────────────────
    /// A break-glass activation was attempted before the configured cooldown
    /// since the invoker's last event elapsed.
    #[error("break-glass cooldown still active")]
    CooldownActive,

    /// A break-glass activation would exceed the per-user or per-profile
    /// quota for the configured window.
    #[error("break-glass quota exceeded")]
    QuotaExceeded,

    // ── Transport ──────────────────────────────────────────────────────
    /// A transient/network error; the caller may retry.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// A non-retriable authorization failure from an upstream service.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // ── Wrapped ────────────────────────────────────────────────────────
    /// Underlying store error, tagged with table + operation context.
    #[error("store error ({table}.{op}): {source}")]
    Store {
        /// Table name (`approval`, `breakglass`, `session`).
        table: &'static str,
        /// Operation name (`create`, `update`, `get`, ...).
        op: &'static str,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML (de)serialization failure (policy documents, configuration).
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for conditions that should be unreachable in correct
    /// operation; never shown to end users verbatim (sanitized at the
    /// HTTP boundary per §7).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a lower-level error with table/operation context, as store
    /// implementations do before returning to callers (spec §7
    /// "Propagation policy").
    #[must_use]
    pub fn store(table: &'static str, op: &'static str, source: Error) -> Self {
        Self::Store {
            table,
            op,
            source: Box::new(source),
        }
    }

    /// Whether the orchestrator may retry this error per §7 ("the
    /// orchestrator recovers only from retriable transport errors").
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::PolicyUnavailable(_))
    }

    /// A message safe to return to an external caller: internal detail is
    /// dropped, matching §7's "User-visible messages are sanitized".
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidId(_) | Self::InvalidPolicy(_) | Self::InvalidTimeWindow(_) => {
                "invalid request"
            }
            Self::PolicyNotFound(_)
            | Self::RequestNotFound(_)
            | Self::EventNotFound(_)
            | Self::SessionNotFound(_) => "not found",
            Self::RequestExists(_) | Self::EventExists(_) | Self::SessionExists(_) => {
                "already exists"
            }
            Self::ConcurrentModification => "concurrent modification, retry",
            Self::SessionAlreadyRevoked(_) => "session already revoked",
            Self::SessionExpired(_) => "session expired",
            Self::ActiveEventAlreadyExists => "active break-glass event already exists",
            Self::PolicyUnsigned | Self::PolicyTampered => "policy verification failed",
            Self::PolicyUnavailable(_) => "policy temporarily unavailable",
            Self::UserNotFound => "user not recognized",
            Self::ChallengeNotFound => "challenge not found",
            Self::ChallengeExpired => "challenge expired",
            Self::InvalidCode => "invalid code",
            Self::CooldownActive => "cooldown active",
            Self::QuotaExceeded => "quota exceeded",
            Self::Unavailable(_) => "service unavailable",
            Self::Unauthorized(_) => "unauthorized",
            Self::Store { .. }
            | Self::Serialization(_)
            | Self::Yaml(_)
            | Self::Io(_)
            | Self::Config(_)
            | Self::Internal(_) => "internal error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_errors_are_flagged() {
        assert!(Error::Unavailable("timeout".into()).is_retriable());
        assert!(Error::PolicyUnavailable("timeout".into()).is_retriable());
        assert!(!Error::ConcurrentModification.is_retriable());
    }

    #[test]
    fn public_message_hides_internal_detail() {
        let err = Error::Internal("stack trace: ...".into());
        assert_eq!(err.public_message(), "internal error");
        assert!(!err.public_message().contains("stack trace"));
    }

    #[test]
    fn store_wraps_with_table_and_op() {
        let err = Error::store("session", "update", Error::ConcurrentModification);
        let msg = err.to_string();
        assert!(msg.contains("session.update"));
    }
}
