//! Shared in-memory conditional-write table, reused by the approval,
//! break-glass, and server-session stores.
//!
//! Grounded on the teacher's `InMemoryTokenStore` (`DashMap`-backed table),
//! generalized with the `attribute_not_exists`/`updated_at`-precondition
//! discipline spec §4.3–§4.5 and §9 require of every durable write.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// An entity storable in a [`ConditionalTable`]: has a stable `id` and an
/// `updated_at` watermark used for optimistic-lock preconditions.
pub trait Entity: Clone {
    fn id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
    fn set_updated_at(&mut self, updated_at: DateTime<Utc>);
}

/// Failure modes for [`ConditionalTable::update`]/[`ConditionalTable::touch`],
/// distinguished so callers can tell "no such row" apart from "lost the
/// optimistic-lock race" (spec §4.3: "differentiated from `ErrNotFound` by
/// a follow-up existence probe").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFailure {
    NotFound,
    ConcurrentModification,
}

/// A `DashMap`-backed table implementing the create/get/update/delete
/// discipline common to C4, C5, and C6.
pub struct ConditionalTable<T: Entity> {
    rows: DashMap<String, T>,
}

impl<T: Entity> Default for ConditionalTable<T> {
    fn default() -> Self {
        Self { rows: DashMap::new() }
    }
}

impl<T: Entity> ConditionalTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Conditional insert: `attribute_not_exists(id)`. Returns `Err(entity)`
    /// (the entity handed back unchanged) if the id is already taken, so
    /// callers can raise their own table-specific "already exists" error.
    pub fn create(&self, entity: T) -> Result<T, T> {
        use dashmap::mapref::entry::Entry;
        match self.rows.entry(entity.id().to_string()) {
            Entry::Occupied(_) => Err(entity),
            Entry::Vacant(vacant) => {
                vacant.insert(entity.clone());
                Ok(entity)
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<T> {
        self.rows.get(id).map(|entry| entry.value().clone())
    }

    pub fn delete(&self, id: &str) -> Option<T> {
        self.rows.remove(id).map(|(_, value)| value)
    }

    /// Optimistic-lock update: the stored `updated_at` must equal
    /// `expected_updated_at`, matching the caller's prior snapshot.
    /// On success, assigns a fresh `updated_at` and returns the persisted
    /// entity so the caller can advance its own in-memory snapshot
    /// (spec §9 "chained updates in the same handler do not self-conflict").
    pub fn update(
        &self,
        id: &str,
        expected_updated_at: DateTime<Utc>,
        mutate: impl FnOnce(&mut T),
    ) -> Result<T, UpdateFailure> {
        let mut entry = self.rows.get_mut(id).ok_or(UpdateFailure::NotFound)?;
        if entry.updated_at() != expected_updated_at {
            return Err(UpdateFailure::ConcurrentModification);
        }
        mutate(&mut entry);
        entry.set_updated_at(crate::id::now());
        Ok(entry.clone())
    }

    /// Hot-path update with only an existence precondition, no
    /// optimistic-lock check (spec §4.5 `Touch`).
    pub fn touch(&self, id: &str, mutate: impl FnOnce(&mut T)) -> Result<T, UpdateFailure> {
        let mut entry = self.rows.get_mut(id).ok_or(UpdateFailure::NotFound)?;
        mutate(&mut entry);
        Ok(entry.clone())
    }

    /// List all rows matching `predicate`, newest-first by `updated_at`,
    /// truncated to `limit` (already clamped by [`super::clamp_limit`]).
    #[must_use]
    pub fn list(&self, predicate: impl Fn(&T) -> bool, limit: usize) -> Vec<T> {
        let mut matched: Vec<T> = self
            .rows
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| b.updated_at().cmp(&a.updated_at()));
        matched.truncate(limit);
        matched
    }
}
