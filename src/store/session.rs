//! Server-session store (C6) — durable live-session records.
//!
//! Extra GSI-equivalent over `(server_instance_id, status)`; `Touch` is a
//! dedicated hot-path operation guarded only by existence, not the full
//! optimistic lock (spec §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::memory::{ConditionalTable, Entity, UpdateFailure};
use super::clamp_limit;
use crate::id;

/// Lifecycle status of a [`ServerSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Revoked,
    Expired,
}

/// A durable server session (spec §3 entity S).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSession {
    pub id: String,
    pub user: String,
    pub profile: String,
    pub server_instance_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub request_count: u64,
    /// The correlation identity stamped onto the issued credential.
    pub source_identity: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked_by: Option<String>,
    #[serde(default)]
    pub revoked_reason: Option<String>,
}

impl Entity for ServerSession {
    fn id(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.updated_at = updated_at;
    }
}

impl ServerSession {
    #[must_use]
    pub fn new(user: String, profile: String, server_instance_id: String, source_identity: String, ttl: chrono::Duration, device_id: Option<String>) -> Self {
        let now = id::now();
        Self {
            id: id::generate(),
            user,
            profile,
            server_instance_id,
            status: SessionStatus::Active,
            started_at: now,
            last_access_at: now,
            expires_at: now + ttl,
            request_count: 0,
            source_identity,
            device_id,
            created_at: now,
            updated_at: now,
            revoked_by: None,
            revoked_reason: None,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The server-session store.
#[derive(Default)]
pub struct SessionStore {
    table: ConditionalTable<ServerSession>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, session: ServerSession) -> crate::Result<ServerSession> {
        let id = session.id.clone();
        self.table.create(session).map_err(|_| crate::Error::SessionExists(id))
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServerSession> {
        self.table.get(id)
    }

    pub fn require(&self, id: &str) -> crate::Result<ServerSession> {
        self.get(id).ok_or_else(|| crate::Error::SessionNotFound(id.to_string()))
    }

    /// Strict optimistic-lock update, mandatory for every field change
    /// except [`Self::touch`] (spec §4.5).
    pub fn update(&self, session: &ServerSession, mutate: impl FnOnce(&mut ServerSession)) -> crate::Result<ServerSession> {
        self.table
            .update(&session.id, session.updated_at, mutate)
            .map_err(|failure| match failure {
                UpdateFailure::NotFound => crate::Error::SessionNotFound(session.id.clone()),
                UpdateFailure::ConcurrentModification => crate::Error::ConcurrentModification,
            })
    }

    /// Hot-path `Touch`: set `last_access_at=now`, increment
    /// `request_count`, guarded only by `attribute_exists(id)` (spec §4.5).
    pub fn touch(&self, id: &str) -> crate::Result<ServerSession> {
        self.table
            .touch(id, |s| {
                s.last_access_at = id::now();
                s.request_count += 1;
            })
            .map_err(|failure| match failure {
                UpdateFailure::NotFound => crate::Error::SessionNotFound(id.to_string()),
                UpdateFailure::ConcurrentModification => crate::Error::ConcurrentModification,
            })
    }

    /// Find the active session for a given server instance (the
    /// `server_instance_id`+`status` GSI, spec §4.5).
    #[must_use]
    pub fn find_active_for_instance(&self, server_instance_id: &str) -> Option<ServerSession> {
        self.table
            .list(
                |s| s.server_instance_id == server_instance_id && s.status == SessionStatus::Active,
                1,
            )
            .into_iter()
            .next()
    }

    #[must_use]
    pub fn list_by_status(&self, status: SessionStatus, limit: Option<usize>) -> Vec<ServerSession> {
        self.table.list(|s| s.status == status, clamp_limit(limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> ServerSession {
        ServerSession::new(
            "alice".into(),
            "prod".into(),
            "instance-1".into(),
            "sentinel:alice:0123456789abcdef".into(),
            chrono::Duration::hours(1),
            None,
        )
    }

    #[test]
    fn touch_does_not_require_optimistic_lock() {
        let store = SessionStore::new();
        let session = store.create(new_session()).unwrap();
        // Touch succeeds even though we never supply `updated_at`.
        let touched = store.touch(&session.id).unwrap();
        assert_eq!(touched.request_count, 1);
        let touched_again = store.touch(&session.id).unwrap();
        assert_eq!(touched_again.request_count, 2);
    }

    #[test]
    fn update_advances_caller_snapshot_for_chained_calls() {
        let store = SessionStore::new();
        let session = store.create(new_session()).unwrap();
        let updated = store
            .update(&session, |s| {
                s.status = SessionStatus::Revoked;
            })
            .unwrap();
        assert_ne!(updated.updated_at, session.updated_at);
        // A second update using the fresh snapshot succeeds.
        let again = store.update(&updated, |s| s.revoked_reason = Some("test".into())).unwrap();
        assert_eq!(again.revoked_reason, Some("test".to_string()));
    }

    #[test]
    fn stale_snapshot_update_conflicts() {
        let store = SessionStore::new();
        let session = store.create(new_session()).unwrap();
        store.update(&session, |s| s.status = SessionStatus::Revoked).unwrap();
        // Reusing the original (stale) snapshot must fail.
        let err = store.update(&session, |s| s.status = SessionStatus::Expired).unwrap_err();
        assert!(matches!(err, crate::Error::ConcurrentModification));
    }

    #[test]
    fn find_active_for_instance() {
        let store = SessionStore::new();
        let session = store.create(new_session()).unwrap();
        let found = store.find_active_for_instance("instance-1").unwrap();
        assert_eq!(found.id, session.id);
    }
}
