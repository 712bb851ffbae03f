//! facewatch-store: persisted identities, identification events and the
//! video source registry.
//!
//! The pipeline only sees the [`GalleryStore`] and [`EventLog`] traits.
//! [`SqliteStore`] implements both on one SQLite file and adds the
//! administrative operations (enrollment, source registry, event deletion);
//! [`MemoryStore`] implements the traits for tests and ephemeral runs.

pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod status;

use chrono::{DateTime, Utc};
use facewatch_core::{IdentificationEvent, Identity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use status::{summarize, window_start, IdentityStatus, PresenceSummary, StatusReport};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("identity with external code {0:?} already exists")]
    DuplicateCode(String),
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: i64 },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of enrolled identities.
pub trait GalleryStore: Send + Sync {
    fn load_all_identities(&self) -> Result<Vec<Identity>, StoreError>;
}

/// Append-only log of identification events.
pub trait EventLog: Send + Sync {
    /// Append one event; returns its row id. Each append is an independent
    /// insert.
    fn append(&self, event: &IdentificationEvent) -> Result<i64, StoreError>;

    /// Events at or after `since`, oldest first, optionally for one identity.
    fn query_recent(&self, identity: Option<&str>, since: DateTime<Utc>) -> Result<Vec<StoredEvent>, StoreError>;
}

/// An event together with its log row id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: IdentificationEvent,
}

/// Input for enrolling a new identity.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub display_name: String,
    pub external_code: String,
    pub embedding: facewatch_core::Embedding,
    pub reference_image: Option<String>,
}

/// A registered camera or stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: i64,
    pub name: String,
    /// Registry kind: `device`, `file`, `rtsp`, `rtmp`, `ip`, `http`, `cctv`.
    pub kind: String,
    pub locator: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for registering a source.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub kind: String,
    pub locator: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub active: bool,
}
