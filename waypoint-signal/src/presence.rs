//! Presence Store: last-known attributes for every announced identity.
//!
//! The roster keeps insertion order (first-seen-first) so snapshots are
//! deterministic. Upserts are partial: only supplied fields change, and an
//! update for a never-announced identity creates a record with the same
//! defaults the browser clients fall back to.

use tokio::sync::RwLock;

use crate::protocol::{ClientId, Coordinates, PresenceRecord};

/// Display name used when an identity gets presence state before it has
/// announced one (matches the client-side fallback).
const DEFAULT_NAME: &str = "Anonymous";

/// Partial presence mutation. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub name: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub speed: Option<f64>,
    pub is_supported: Option<bool>,
    pub permission_status: Option<String>,
}

impl PresenceUpdate {
    /// The initial announce: display name plus position.
    pub fn announce(name: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            name: Some(name.into()),
            coordinates: Some(coordinates),
            ..Self::default()
        }
    }

    /// A motion update.
    pub fn speed(speed: f64) -> Self {
        Self {
            speed: Some(speed),
            ..Self::default()
        }
    }

    fn apply(self, record: &mut PresenceRecord) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(coordinates) = self.coordinates {
            record.coordinates = coordinates;
        }
        if let Some(speed) = self.speed {
            record.speed = Some(speed);
        }
        if let Some(is_supported) = self.is_supported {
            record.is_supported = Some(is_supported);
        }
        if let Some(permission_status) = self.permission_status {
            record.permission_status = Some(permission_status);
        }
    }
}

/// Insertion-ordered roster of presence records, at most one per identity.
pub struct PresenceStore {
    records: RwLock<Vec<PresenceRecord>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    /// Apply a partial update and return the post-update roster snapshot.
    ///
    /// Update and snapshot happen under one lock acquisition so the roster
    /// a broadcast carries is consistent with the change that triggered it.
    pub async fn upsert(&self, id: ClientId, update: PresenceUpdate) -> Vec<PresenceRecord> {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => update.apply(record),
            None => {
                let mut record = PresenceRecord::new(
                    id,
                    DEFAULT_NAME,
                    Coordinates::new(0.0, 0.0),
                );
                update.apply(&mut record);
                records.push(record);
            }
        }
        records.clone()
    }

    /// Delete the record for `id`. No error if absent; returns whether a
    /// record was actually removed.
    pub async fn remove(&self, id: ClientId) -> bool {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        records.len() != before
    }

    /// Current roster in insertion order.
    pub async fn snapshot(&self) -> Vec<PresenceRecord> {
        self.records.read().await.clone()
    }

    pub async fn contains(&self, id: ClientId) -> bool {
        self.records.read().await.iter().any(|r| r.id == id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}
