//! Revocation engine (C7).
//!
//! `Revoke` validates the session's current state transition and commits
//! through [`crate::store::session::SessionStore::update`]; `IsSessionRevoked`
//! is the fail-open companion the credential server's hot path calls on
//! every request (spec §4.6, §9 "Fail-open revocation check").

use crate::store::session::{ServerSession, SessionStatus, SessionStore};

/// Revoke `session_id`, validating the transition per spec §4.6:
/// `active -> revoked` is the only permitted move.
pub fn revoke(store: &SessionStore, session_id: &str, revoked_by: &str, reason: &str) -> crate::Result<ServerSession> {
    crate::id::validate(session_id)?;
    if revoked_by.trim().is_empty() {
        return Err(crate::Error::InvalidId("revoked_by must not be empty".to_string()));
    }
    if reason.trim().is_empty() {
        return Err(crate::Error::InvalidId("reason must not be empty".to_string()));
    }

    let session = store.require(session_id)?;
    match session.status {
        SessionStatus::Active => {}
        SessionStatus::Revoked => return Err(crate::Error::SessionAlreadyRevoked(session_id.to_string())),
        SessionStatus::Expired => return Err(crate::Error::SessionExpired(session_id.to_string())),
    }

    store.update(&session, |s| {
        s.status = SessionStatus::Revoked;
        s.revoked_by = Some(revoked_by.to_string());
        s.revoked_reason = Some(reason.to_string());
    })
}

/// Fail-open revocation probe for the credential server's hot path:
/// not-found -> `false`; revoked -> `true`; any store error propagates so
/// the caller may choose to fail open (spec §4.6, §9).
pub fn is_session_revoked(store: &SessionStore, session_id: &str) -> crate::Result<bool> {
    match store.get(session_id) {
        Some(session) => Ok(session.status == SessionStatus::Revoked),
        None => Ok(false),
    }
}
