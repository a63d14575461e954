//! Policy evaluator (C3) — `Evaluate(policy, request) -> Decision`.
//!
//! Grounded on the teacher's `PolicyEngine::resolve_scopes`: an ordered
//! rule list, first-match-wins, with "no match" a distinct terminal case.
//! Unlike the teacher's `Option<T>`-means-wildcard match criteria, this
//! spec defines empty-*set* as wildcard for `profiles`/`users`, and adds a
//! `time` dimension the teacher has no equivalent for.

use super::{Conditions, Decision, Effect, Policy, Request, Rule};

const NO_MATCHING_RULE: &str = "no-matching-rule";

/// Evaluate `request` against `policy`, returning the first matching
/// rule's decision, or an implicit deny if nothing matches (spec §4.2).
pub fn evaluate(policy: &Policy, request: &Request) -> crate::Result<Decision> {
    for rule in &policy.rules {
        if matches(&rule.conditions, request)? {
            return Ok(materialize(rule));
        }
    }
    Ok(Decision {
        effect: Effect::Deny,
        matched_rule_name: String::new(),
        reason: NO_MATCHING_RULE.to_string(),
        requires_session_tracking: false,
    })
}

fn matches(conditions: &Conditions, request: &Request) -> crate::Result<bool> {
    if !conditions.profiles.is_empty() && !conditions.profiles.contains(&request.profile) {
        return Ok(false);
    }
    if !conditions.users.is_empty() && !conditions.users.contains(&request.user) {
        return Ok(false);
    }
    if let Some(window) = &conditions.time
        && !window.matches(request.instant)?
    {
        return Ok(false);
    }
    Ok(true)
}

fn materialize(rule: &Rule) -> Decision {
    Decision {
        effect: rule.effect,
        matched_rule_name: rule.name.clone(),
        reason: rule.reason.clone(),
        requires_session_tracking: matches!(rule.effect, Effect::RequireServerSession),
    }
}
