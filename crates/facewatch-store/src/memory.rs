//! In-memory gallery store and event log.

use crate::{EventLog, GalleryStore, StoreError, StoredEvent};
use chrono::{DateTime, Utc};
use facewatch_core::{IdentificationEvent, Identity};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: Vec<Identity>,
    events: Mutex<Vec<StoredEvent>>,
    /// When set, every append fails. Used to exercise dropped-event handling.
    reject_appends: bool,
}

impl MemoryStore {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self {
            identities,
            ..Self::default()
        }
    }

    /// A store whose event log refuses every append.
    pub fn rejecting_appends(identities: Vec<Identity>) -> Self {
        Self {
            identities,
            reject_appends: true,
            ..Self::default()
        }
    }

    fn events(&self) -> MutexGuard<'_, Vec<StoredEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Every appended event in append order.
    pub fn all_events(&self) -> Vec<IdentificationEvent> {
        self.events().iter().map(|e| e.event.clone()).collect()
    }
}

impl GalleryStore for MemoryStore {
    fn load_all_identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.identities.clone())
    }
}

impl EventLog for MemoryStore {
    fn append(&self, event: &IdentificationEvent) -> Result<i64, StoreError> {
        if self.reject_appends {
            return Err(StoreError::Unavailable("event log is read-only".to_string()));
        }
        let mut events = self.events();
        let id = events.len() as i64 + 1;
        events.push(StoredEvent { id, event: event.clone() });
        Ok(id)
    }

    fn query_recent(&self, identity: Option<&str>, since: DateTime<Utc>) -> Result<Vec<StoredEvent>, StoreError> {
        let mut out: Vec<StoredEvent> = self
            .events()
            .iter()
            .filter(|e| e.event.timestamp >= since)
            .filter(|e| identity.map_or(true, |name| e.event.identity_name == name))
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.event.timestamp, e.id));
        Ok(out)
    }
}
