//! Policy document types, evaluator (C3), and signed loader (C2).
//!
//! Grounded on the teacher's `key_server::policy` module shape (ordered
//! rule list, first-match-wins evaluation) and `key_server::oidc`'s cached,
//! signature-verified fetch pattern, generalized to the conditions and
//! effects this spec defines.

pub mod evaluator;
pub mod loader;

use std::collections::BTreeSet;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// The five possible outcomes of evaluating a request against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
    RequireApproval,
    RequireServer,
    RequireServerSession,
}

/// A half-open hour range `[start, end)` within a single day, `HH:MM` form.
/// `end` of `"24:00"` is accepted as an end-of-day alias for midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: String,
    pub end: String,
}

impl HourRange {
    /// Parse `start`/`end` into minute-of-day offsets, `end == "24:00"`
    /// mapping to `1440` so the half-open comparison `start <= m < end`
    /// treats midnight as the close of the day rather than its start.
    fn minute_bounds(&self) -> crate::Result<(u32, u32)> {
        let start = parse_hhmm(&self.start)?;
        let end = if self.end == "24:00" {
            24 * 60
        } else {
            parse_hhmm(&self.end)?
        };
        Ok((start, end))
    }
}

fn parse_hhmm(value: &str) -> crate::Result<u32> {
    let (h, m) = value
        .split_once(':')
        .ok_or_else(|| crate::Error::InvalidTimeWindow(format!("malformed HH:MM: {value}")))?;
    let h: u32 = h
        .parse()
        .map_err(|_| crate::Error::InvalidTimeWindow(format!("malformed hour: {value}")))?;
    let m: u32 = m
        .parse()
        .map_err(|_| crate::Error::InvalidTimeWindow(format!("malformed minute: {value}")))?;
    if h > 23 || m > 59 {
        return Err(crate::Error::InvalidTimeWindow(format!(
            "hour/minute out of range: {value}"
        )));
    }
    Ok(h * 60 + m)
}

/// A time window: a set of weekdays, an optional hour range, and the IANA
/// timezone the wall-clock comparison is performed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: BTreeSet<chrono::Weekday>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<HourRange>,
    pub timezone: String,
}

impl TimeWindow {
    /// Whether `instant` (a UTC timestamp) falls inside this window, once
    /// converted into the window's configured timezone.
    fn matches(&self, instant: DateTime<Utc>) -> crate::Result<bool> {
        let tz: chrono_tz::Tz = self
            .timezone
            .parse()
            .map_err(|_| crate::Error::InvalidTimeWindow(format!("unknown timezone: {}", self.timezone)))?;
        let local = instant.with_timezone(&tz);
        if !self.days.contains(&local.date_naive().weekday()) {
            return Ok(false);
        }
        let Some(hours) = &self.hours else {
            return Ok(true);
        };
        let (start, end) = hours.minute_bounds()?;
        let minute_of_day = local.time().hour() * 60 + local.time().minute();
        Ok(minute_of_day >= start && minute_of_day < end)
    }
}

/// Match conditions for a rule. Empty `profiles`/`users` sets mean
/// "matches any" (spec §3/§8 boundary case).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub profiles: BTreeSet<String>,
    #[serde(default)]
    pub users: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeWindow>,
}

/// A single ordered rule in a policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub effect: Effect,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub reason: String,
}

/// A policy document: a version tag plus an ordered rule list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub version: String,
    pub rules: Vec<Rule>,
}

impl Policy {
    /// Structural validation: every rule must have a non-empty `name`.
    pub fn validate(&self) -> crate::Result<()> {
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(crate::Error::InvalidPolicy(
                    "rule name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Parse a policy document from its YAML/JSON wire form (spec §6).
    /// JSON is a subset of YAML, so a single YAML parse covers both.
    pub fn parse(bytes: &[u8]) -> crate::Result<Self> {
        let policy: Self = serde_yaml::from_slice(bytes)?;
        policy.validate()?;
        Ok(policy)
    }
}

/// A credential request presented to the evaluator.
#[derive(Debug, Clone)]
pub struct Request {
    pub user: String,
    pub profile: String,
    pub instant: DateTime<Utc>,
}

/// The transient outcome of evaluating a [`Request`] against a [`Policy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub effect: Effect,
    pub matched_rule_name: String,
    pub reason: String,
    pub requires_session_tracking: bool,
}
