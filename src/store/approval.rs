//! Approval store (C4) — durable lifecycle for approval requests.
//!
//! Built on the shared [`super::memory::ConditionalTable`]; GSIs (`requester`,
//! `status`, `profile`) are modeled as predicate closures over the full
//! table scan, a reasonable stand-in for indexed queries at in-memory scale
//! (spec §4.3).

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::memory::{ConditionalTable, Entity, UpdateFailure};
use super::{clamp_limit, DEFAULT_LIST_LIMIT};
use crate::id;

/// Lifecycle status of an [`ApprovalRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    /// Terminal statuses are sinks: no transition leaves them (spec §3).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A durable approval request (spec §3 entity R).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub requester: String,
    pub profile: String,
    pub justification: String,
    #[serde(with = "super::duration_seconds")]
    pub duration: chrono::Duration,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default)]
    pub approver_comment: Option<String>,
}

impl Entity for ApprovalRequest {
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

/// Maximum lifetime granted to a new approval request absent an explicit
/// shorter `expires_at` (spec §3: "default ≤ 24h").
pub const DEFAULT_TTL_HOURS: i64 = 24;

impl ApprovalRequest {
    /// Construct a new pending request, id-generated, timestamps stamped
    /// to `now`, `expires_at` defaulted to `created_at + 24h` if unset.
    #[must_use]
    pub fn new(requester: String, profile: String, justification: String, duration: chrono::Duration) -> Self {
        let now = id::now();
        Self {
            id: id::generate(),
            requester,
            profile,
            justification,
            duration,
            status: ApprovalStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::hours(DEFAULT_TTL_HOURS),
            approver: None,
            approver_comment: None,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The approval store: durable table + secondary-index-equivalent queries.
#[derive(Default)]
pub struct ApprovalStore {
    table: ConditionalTable<ApprovalRequest>,
}

impl ApprovalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, request: ApprovalRequest) -> crate::Result<ApprovalRequest> {
        let id = request.id.clone();
        self.table
            .create(request)
            .map_err(|_| crate::Error::RequestExists(id))
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        self.table.get(id)
    }

    pub fn require(&self, id: &str) -> crate::Result<ApprovalRequest> {
        self.get(id)
            .ok_or_else(|| crate::Error::RequestNotFound(id.to_string()))
    }

    pub fn delete(&self, id: &str) -> Option<ApprovalRequest> {
        self.table.delete(id)
    }

    /// Optimistic-lock update keyed by the caller's previously observed
    /// `updated_at` (spec §4.3).
    pub fn update(&self, request: &ApprovalRequest, mutate: impl FnOnce(&mut ApprovalRequest)) -> crate::Result<ApprovalRequest> {
        self.table
            .update(&request.id, request.updated_at, mutate)
            .map_err(|failure| match failure {
                UpdateFailure::NotFound => crate::Error::RequestNotFound(request.id.clone()),
                UpdateFailure::ConcurrentModification => crate::Error::ConcurrentModification,
            })
    }

    #[must_use]
    pub fn list_by_requester(&self, requester: &str, limit: Option<usize>) -> Vec<ApprovalRequest> {
        self.table.list(|r| r.requester == requester, clamp_limit(limit))
    }

    #[must_use]
    pub fn list_by_status(&self, status: ApprovalStatus, limit: Option<usize>) -> Vec<ApprovalRequest> {
        self.table.list(|r| r.status == status, clamp_limit(limit))
    }

    #[must_use]
    pub fn list_by_profile(&self, profile: &str, limit: Option<usize>) -> Vec<ApprovalRequest> {
        self.table.list(|r| r.profile == profile, clamp_limit(limit))
    }

    /// Find an approved, not-yet-expired request for `(requester, profile)`
    /// — the lookup the orchestrator performs for `require_approval`
    /// (spec §4.12).
    #[must_use]
    pub fn find_active_approval(&self, requester: &str, profile: &str, now: DateTime<Utc>) -> Option<ApprovalRequest> {
        self.table
            .list(
                |r| {
                    r.requester == requester
                        && r.profile == profile
                        && r.status == ApprovalStatus::Approved
                        && !r.is_expired(now)
                },
                DEFAULT_LIST_LIMIT,
            )
            .into_iter()
            .next()
    }
}

/// Pairs a profile-glob set with the approver users authorized to act on
/// requests for matching profiles, plus optional auto-approve conditions
/// (spec §4.3 "approval policy").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicyRule {
    pub profile_globs: Vec<String>,
    pub approvers: BTreeSet<String>,
    #[serde(default)]
    pub auto_approve: Option<AutoApproveConditions>,
}

/// Conditions under which a request is approved without a human approver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApproveConditions {
    #[serde(default)]
    pub users: BTreeSet<String>,
    #[serde(default, with = "super::duration_seconds_option")]
    pub max_duration: Option<chrono::Duration>,
}

/// An ordered list of [`ApprovalPolicyRule`]s governing who may approve
/// requests for which profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub rules: Vec<ApprovalPolicyRule>,
}

impl ApprovalPolicy {
    fn matching_rule(&self, profile: &str) -> Option<&ApprovalPolicyRule> {
        self.rules
            .iter()
            .find(|rule| rule.profile_globs.iter().any(|glob| glob_matches(glob, profile)))
    }

    /// Whether `approver` has authority to act on requests for `profile`.
    #[must_use]
    pub fn can_approve(&self, approver: &str, profile: &str) -> bool {
        self.matching_rule(profile)
            .is_some_and(|rule| rule.approvers.contains(approver))
    }

    /// Whether a newly created request should be auto-approved.
    #[must_use]
    pub fn auto_approves(&self, profile: &str, requester: &str, duration: chrono::Duration) -> bool {
        let Some(rule) = self.matching_rule(profile) else {
            return false;
        };
        let Some(auto) = &rule.auto_approve else {
            return false;
        };
        if !auto.users.is_empty() && !auto.users.contains(requester) {
            return false;
        }
        if let Some(max) = auto.max_duration
            && duration > max
        {
            return false;
        }
        true
    }
}

fn glob_matches(glob: &str, value: &str) -> bool {
    if let Some(prefix) = glob.strip_suffix('*') {
        value.starts_with(prefix)
    } else {
        glob == value
    }
}

/// The approval state machine service: wraps [`ApprovalStore`] with the
/// authority checks approval-policy requires (spec §4.3 caller layer).
pub struct ApprovalService {
    store: Arc<ApprovalStore>,
    policy: ApprovalPolicy,
}

impl ApprovalService {
    #[must_use]
    pub fn new(store: Arc<ApprovalStore>, policy: ApprovalPolicy) -> Self {
        Self { store, policy }
    }

    /// Submit a new request, auto-approving immediately if the policy's
    /// auto-approve conditions match.
    pub fn submit(&self, requester: String, profile: String, justification: String, duration: chrono::Duration) -> crate::Result<ApprovalRequest> {
        let mut request = ApprovalRequest::new(requester.clone(), profile.clone(), justification, duration);
        if self.policy.auto_approves(&profile, &requester, duration) {
            request.status = ApprovalStatus::Approved;
            request.approver = Some("auto-approve".to_string());
        }
        self.store.create(request)
    }

    /// Approve a pending request as `approver`, provided the approval
    /// policy grants `approver` authority over `request.profile`.
    pub fn approve(&self, request: &ApprovalRequest, approver: &str, comment: Option<String>) -> crate::Result<ApprovalRequest> {
        self.transition(request, approver, comment, ApprovalStatus::Approved)
    }

    /// Deny a pending request.
    pub fn deny(&self, request: &ApprovalRequest, approver: &str, comment: Option<String>) -> crate::Result<ApprovalRequest> {
        self.transition(request, approver, comment, ApprovalStatus::Denied)
    }

    /// Look up an approved, not-yet-expired request for `(requester,
    /// profile)`, the lookup the orchestrator performs for `require_approval`
    /// (spec §4.12).
    #[must_use]
    pub fn find_active_approval(&self, requester: &str, profile: &str, now: DateTime<Utc>) -> Option<ApprovalRequest> {
        self.store.find_active_approval(requester, profile, now)
    }

    /// Cancel a pending request (by the requester or an operator).
    pub fn cancel(&self, request: &ApprovalRequest) -> crate::Result<ApprovalRequest> {
        if request.status.is_terminal() {
            return Err(crate::Error::ConcurrentModification);
        }
        self.store.update(request, |r| {
            r.status = ApprovalStatus::Cancelled;
        })
    }

    fn transition(
        &self,
        request: &ApprovalRequest,
        approver: &str,
        comment: Option<String>,
        new_status: ApprovalStatus,
    ) -> crate::Result<ApprovalRequest> {
        if request.status.is_terminal() {
            return Err(crate::Error::ConcurrentModification);
        }
        if !self.policy.can_approve(approver, &request.profile) {
            return Err(crate::Error::Unauthorized(format!(
                "{approver} is not an authorized approver for {}",
                request.profile
            )));
        }
        self.store.update(request, |r| {
            r.status = new_status;
            r.approver = Some(approver.to_string());
            r.approver_comment = comment;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_allowing(approver: &str, profile_glob: &str) -> ApprovalPolicy {
        ApprovalPolicy {
            rules: vec![ApprovalPolicyRule {
                profile_globs: vec![profile_glob.to_string()],
                approvers: [approver.to_string()].into_iter().collect(),
                auto_approve: None,
            }],
        }
    }

    #[test]
    fn create_is_unique_by_id() {
        let store = ApprovalStore::new();
        let request = ApprovalRequest::new("alice".into(), "prod".into(), "why".into(), chrono::Duration::hours(1));
        store.create(request.clone()).unwrap();
        let err = store.create(request).unwrap_err();
        assert!(matches!(err, crate::Error::RequestExists(_)));
    }

    #[test]
    fn concurrent_approval_race_scenario() {
        // scenario 3 from spec §8
        let store = Arc::new(ApprovalStore::new());
        let policy = policy_allowing("approver-a", "prod");
        let mut policy = policy;
        policy.rules.push(ApprovalPolicyRule {
            profile_globs: vec!["prod".to_string()],
            approvers: ["approver-b".to_string()].into_iter().collect(),
            auto_approve: None,
        });
        // Both approvers must be authorized for this scenario; merge into one rule.
        policy.rules[0].approvers.insert("approver-b".to_string());

        let service = ApprovalService::new(Arc::clone(&store), policy);
        let mut request = ApprovalRequest::new("alice".into(), "prod".into(), "deploy".into(), chrono::Duration::hours(1));
        request.id = "aaaaaaaaaaaaaaaa".to_string();
        let request = store.create(request).unwrap();

        // Approver A reads current snapshot and approves.
        let snapshot_a = request.clone();
        let approved = service.approve(&snapshot_a, "approver-a", None).unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);

        // Approver B reads the *old* snapshot (stale updated_at) and denies.
        let stale_snapshot_b = request;
        let result = service.deny(&stale_snapshot_b, "approver-b", None);
        assert!(matches!(result, Err(crate::Error::ConcurrentModification)));
    }

    #[test]
    fn terminal_status_rejects_further_updates() {
        let store = Arc::new(ApprovalStore::new());
        let policy = policy_allowing("approver-a", "prod");
        let service = ApprovalService::new(Arc::clone(&store), policy);
        let request = ApprovalRequest::new("alice".into(), "prod".into(), "why".into(), chrono::Duration::hours(1));
        let request = store.create(request).unwrap();
        let approved = service.approve(&request, "approver-a", None).unwrap();
        let result = service.deny(&approved, "approver-a", None);
        assert!(matches!(result, Err(crate::Error::ConcurrentModification)));
    }

    #[test]
    fn unauthorized_approver_is_rejected() {
        let store = Arc::new(ApprovalStore::new());
        let policy = policy_allowing("approver-a", "prod");
        let service = ApprovalService::new(Arc::clone(&store), policy);
        let request = ApprovalRequest::new("alice".into(), "prod".into(), "why".into(), chrono::Duration::hours(1));
        let request = store.create(request).unwrap();
        let result = service.approve(&request, "mallory", None);
        assert!(matches!(result, Err(crate::Error::Unauthorized(_))));
    }

    #[test]
    fn find_active_approval_ignores_expired() {
        let store = ApprovalStore::new();
        let mut request = ApprovalRequest::new("alice".into(), "prod".into(), "why".into(), chrono::Duration::hours(1));
        request.status = ApprovalStatus::Approved;
        request.expires_at = id::now() - chrono::Duration::hours(1);
        store.create(request).unwrap();
        assert!(store.find_active_approval("alice", "prod", id::now()).is_none());
    }
}
