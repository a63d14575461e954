//! Break-glass store + rate limiter (C5).
//!
//! Same skeleton as [`super::approval`], with duplicate-activation
//! rejection and the cooldown/quota/escalation rate-limit ordering spec
//! §4.4 defines.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::memory::{ConditionalTable, Entity, UpdateFailure};
use crate::id;

/// Lifecycle status of a [`BreakGlassEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakGlassStatus {
    Active,
    Closed,
    Expired,
}

/// Why an operator is invoking emergency access (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Incident,
    Maintenance,
    Security,
    Recovery,
    Other,
}

/// A durable break-glass event (spec §3 entity B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakGlassEvent {
    pub id: String,
    pub invoker: String,
    pub profile: String,
    pub reason_code: ReasonCode,
    pub justification: String,
    #[serde(with = "super::duration_seconds")]
    pub duration: chrono::Duration,
    pub status: BreakGlassStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_by: Option<String>,
    #[serde(default)]
    pub close_reason: Option<String>,
    pub mfa_method: String,
    pub mfa_challenge_id: String,
    /// Optimistic-lock watermark; not part of the spec's listed fields but
    /// required by the shared [`Entity`] discipline every table uses.
    pub updated_at: DateTime<Utc>,
}

/// Hard cap on a break-glass activation's duration (spec §3: "capped ≤ 4h").
pub const MAX_DURATION_HOURS: i64 = 4;

impl Entity for BreakGlassEvent {
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

impl BreakGlassEvent {
    #[must_use]
    pub fn new(
        invoker: String,
        profile: String,
        reason_code: ReasonCode,
        justification: String,
        duration: chrono::Duration,
        mfa_method: String,
        mfa_challenge_id: String,
    ) -> Self {
        let now = id::now();
        let capped = duration.min(chrono::Duration::hours(MAX_DURATION_HOURS));
        Self {
            id: id::generate(),
            invoker,
            profile,
            reason_code,
            justification,
            duration: capped,
            status: BreakGlassStatus::Active,
            started_at: now,
            expires_at: now + capped,
            closed_by: None,
            close_reason: None,
            mfa_method,
            mfa_challenge_id,
            updated_at: now,
        }
    }
}

/// Break-glass store.
#[derive(Default)]
pub struct BreakGlassStore {
    table: ConditionalTable<BreakGlassEvent>,
}

impl BreakGlassStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, event: BreakGlassEvent) -> crate::Result<BreakGlassEvent> {
        let id = event.id.clone();
        self.table.create(event).map_err(|_| crate::Error::EventExists(id))
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<BreakGlassEvent> {
        self.table.get(id)
    }

    pub fn close(&self, event: &BreakGlassEvent, closed_by: &str, close_reason: &str) -> crate::Result<BreakGlassEvent> {
        self.table
            .update(&event.id, event.updated_at, |e| {
                e.status = BreakGlassStatus::Closed;
                e.closed_by = Some(closed_by.to_string());
                e.close_reason = Some(close_reason.to_string());
            })
            .map_err(|failure| match failure {
                UpdateFailure::NotFound => crate::Error::EventNotFound(event.id.clone()),
                UpdateFailure::ConcurrentModification => crate::Error::ConcurrentModification,
            })
    }

    /// `FindActiveByInvokerAndProfile` (spec §4.4) — used to reject
    /// duplicate activations.
    #[must_use]
    pub fn find_active(&self, invoker: &str, profile: &str) -> Option<BreakGlassEvent> {
        self.table
            .list(
                |e| e.invoker == invoker && e.profile == profile && e.status == BreakGlassStatus::Active,
                1,
            )
            .into_iter()
            .next()
    }

    #[must_use]
    pub fn count_by_invoker_since(&self, invoker: &str, since: DateTime<Utc>) -> usize {
        self.table
            .list(|e| e.invoker == invoker && e.started_at >= since, super::MAX_LIST_LIMIT)
            .len()
    }

    #[must_use]
    pub fn count_by_profile_since(&self, profile: &str, since: DateTime<Utc>) -> usize {
        self.table
            .list(|e| e.profile == profile && e.started_at >= since, super::MAX_LIST_LIMIT)
            .len()
    }

    #[must_use]
    pub fn last_by_invoker_and_profile(&self, invoker: &str, profile: &str) -> Option<BreakGlassEvent> {
        self.table
            .list(|e| e.invoker == invoker && e.profile == profile, 1)
            .into_iter()
            .next()
    }
}

/// The break-glass authorization policy: which users/profiles/reason codes
/// are permitted, and the rate-limit thresholds (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakGlassPolicy {
    /// Users authorized to invoke break-glass. Must not be empty — the
    /// spec forbids an empty `users` list at validation ("break-glass must
    /// name authorized users explicitly").
    pub users: BTreeSet<String>,
    /// Profiles this policy applies to; empty means "all profiles".
    #[serde(default)]
    pub profiles: BTreeSet<String>,
    /// Reason codes permitted; empty means "all codes permitted".
    #[serde(default)]
    pub allowed_reason_codes: BTreeSet<ReasonCode>,
    #[serde(with = "super::duration_seconds")]
    pub cooldown: chrono::Duration,
    pub max_per_user: usize,
    pub max_per_profile: usize,
    #[serde(with = "super::duration_seconds")]
    pub quota_window: chrono::Duration,
    pub escalation_threshold: usize,
}

impl Default for BreakGlassPolicy {
    /// An empty, deliberately invalid policy (fails [`Self::validate`]) so
    /// a deployment that forgets to configure break-glass fails closed
    /// instead of silently authorizing nobody or everybody.
    fn default() -> Self {
        Self {
            users: BTreeSet::new(),
            profiles: BTreeSet::new(),
            allowed_reason_codes: BTreeSet::new(),
            cooldown: chrono::Duration::minutes(15),
            max_per_user: 3,
            max_per_profile: 10,
            quota_window: chrono::Duration::hours(24),
            escalation_threshold: 5,
        }
    }
}

impl BreakGlassPolicy {
    /// Structural validation: `users` must be explicit and non-empty.
    pub fn validate(&self) -> crate::Result<()> {
        if self.users.is_empty() {
            return Err(crate::Error::InvalidPolicy(
                "break-glass policy must name authorized users explicitly".to_string(),
            ));
        }
        Ok(())
    }

    fn applies_to_profile(&self, profile: &str) -> bool {
        self.profiles.is_empty() || self.profiles.contains(profile)
    }

    fn permits_reason(&self, reason: ReasonCode) -> bool {
        self.allowed_reason_codes.is_empty() || self.allowed_reason_codes.contains(&reason)
    }
}

impl std::hash::Hash for ReasonCode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
    }
}
impl PartialOrd for ReasonCode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReasonCode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

/// Outcome of a rate-limit check: which gate rejected, if any (spec §4.4
/// "short-circuit on first failure").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed { escalate: bool },
    CooldownActive,
    QuotaExceeded,
}

/// Evaluate the break-glass rate-limit gates in spec-mandated order.
#[must_use]
pub fn check_rate_limit(store: &BreakGlassStore, policy: &BreakGlassPolicy, invoker: &str, profile: &str, now: DateTime<Utc>) -> RateLimitOutcome {
    if let Some(last) = store.last_by_invoker_and_profile(invoker, profile)
        && now - last.started_at < policy.cooldown
    {
        return RateLimitOutcome::CooldownActive;
    }

    let since = now - policy.quota_window;
    let per_user = store.count_by_invoker_since(invoker, since);
    if per_user >= policy.max_per_user {
        return RateLimitOutcome::QuotaExceeded;
    }

    let per_profile = store.count_by_profile_since(profile, since);
    if per_profile >= policy.max_per_profile {
        return RateLimitOutcome::QuotaExceeded;
    }

    let escalate = per_user + 1 > policy.escalation_threshold;
    RateLimitOutcome::Allowed { escalate }
}

/// Activate break-glass for `(invoker, profile)`, enforcing duplicate
/// rejection, policy authorization, and rate limiting in that order.
pub fn activate(
    store: &BreakGlassStore,
    policy: &BreakGlassPolicy,
    invoker: &str,
    profile: &str,
    reason_code: ReasonCode,
    justification: String,
    duration: chrono::Duration,
    mfa_method: String,
    mfa_challenge_id: String,
) -> crate::Result<BreakGlassEvent> {
    if store.find_active(invoker, profile).is_some() {
        return Err(crate::Error::ActiveEventAlreadyExists);
    }
    if !policy.users.contains(invoker) {
        return Err(crate::Error::Unauthorized(format!("{invoker} is not authorized for break-glass")));
    }
    if !policy.applies_to_profile(profile) {
        return Err(crate::Error::Unauthorized(format!("break-glass not permitted for profile {profile}")));
    }
    if !policy.permits_reason(reason_code) {
        return Err(crate::Error::Unauthorized("reason code not permitted".to_string()));
    }

    let now = id::now();
    match check_rate_limit(store, policy, invoker, profile, now) {
        RateLimitOutcome::CooldownActive => return Err(crate::Error::CooldownActive),
        RateLimitOutcome::QuotaExceeded => return Err(crate::Error::QuotaExceeded),
        RateLimitOutcome::Allowed { escalate } => {
            if escalate {
                tracing::warn!(invoker, profile, "break-glass escalation threshold exceeded");
            }
        }
    }

    let event = BreakGlassEvent::new(
        invoker.to_string(),
        profile.to_string(),
        reason_code,
        justification,
        duration,
        mfa_method,
        mfa_challenge_id,
    );
    store.create(event)
}
