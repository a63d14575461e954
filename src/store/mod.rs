//! Durable-entity store abstractions (C4/C5/C6 common skeleton).
//!
//! Grounded on the teacher's `key_server::store::InMemoryTokenStore`: a
//! `DashMap`-backed table with secondary indices and lazy/explicit
//! eviction. Generalized here into a shared conditional-write primitive
//! (`attribute_not_exists` on create, `updated_at`-keyed optimistic lock on
//! update) since C4/C5/C6 all share this exact discipline (spec §4.3–§4.5,
//! §9 "Concurrent mutation").

pub mod approval;
pub mod breakglass;
pub mod memory;
pub mod session;

/// Default page size for list queries; the hard cap list operations refuse
/// to exceed (spec §4.3 "limits default 100, hard cap 1000").
pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

/// Clamp a caller-supplied list limit into `[1, MAX_LIST_LIMIT]`, defaulting
/// to [`DEFAULT_LIST_LIMIT`] when `None`.
#[must_use]
pub fn clamp_limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// `#[serde(with = "duration_seconds")]` adapter for `chrono::Duration`
/// fields. `chrono`'s `serde` feature covers `DateTime`/`NaiveDateTime` but
/// not `Duration`/`TimeDelta` (chronotope/chrono#117), so every
/// `chrono::Duration` field on a (de)serialized entity needs one of these
/// adapters rather than relying on a derive alone.
pub mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &chrono::Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<chrono::Duration, D::Error> {
        let seconds = i64::deserialize(deserializer)?;
        Ok(chrono::Duration::seconds(seconds))
    }
}

/// `#[serde(with = "duration_seconds_option")]` adapter for
/// `Option<chrono::Duration>` fields; see [`duration_seconds`].
pub mod duration_seconds_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Option<chrono::Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&d.num_seconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<chrono::Duration>, D::Error> {
        let seconds: Option<i64> = Option::deserialize(deserializer)?;
        Ok(seconds.map(chrono::Duration::seconds))
    }
}
