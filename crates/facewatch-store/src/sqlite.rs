//! SQLite implementation of the gallery store, event log and source registry.

use crate::schema;
use crate::{EventLog, GalleryStore, NewIdentity, NewSource, SourceRecord, StoreError, StoredEvent};
use chrono::{DateTime, TimeZone, Utc};
use facewatch_core::{Embedding, IdentificationEvent, Identity, SourceKind};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// One SQLite connection behind a mutex. Every operation is a single
/// statement or a short transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn ms_to_datetime(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("cannot create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        schema::apply_pragmas(&conn)?;
        schema::apply_schema(&conn)?;
        tracing::debug!(path = %path.display(), "store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::apply_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    // --- identities ---

    /// Insert a new identity. The external code must be unique.
    pub fn enroll(&self, new: NewIdentity) -> Result<Identity, StoreError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO identities (display_name, external_code, embedding, model_version, reference_image, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.display_name,
                new.external_code,
                new.embedding.to_le_bytes(),
                new.embedding.model_version,
                new.reference_image,
                Utc::now().timestamp_millis(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => {
                return Err(StoreError::DuplicateCode(new.external_code));
            }
            Err(e) => return Err(e.into()),
        }
        let id = conn.last_insert_rowid();
        tracing::info!(id, name = %new.display_name, code = %new.external_code, "identity enrolled");
        Ok(Identity {
            id,
            display_name: new.display_name,
            external_code: new.external_code,
            embedding: new.embedding,
            reference_image: new.reference_image,
        })
    }

    pub fn remove_identity(&self, id: i64) -> Result<(), StoreError> {
        let removed = self.conn().execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::NotFound { what: "identity", id });
        }
        tracing::info!(id, "identity removed");
        Ok(())
    }

    fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<(Identity, Vec<u8>)> {
        let blob: Vec<u8> = row.get(3)?;
        let identity = Identity {
            id: row.get(0)?,
            display_name: row.get(1)?,
            external_code: row.get(2)?,
            embedding: Embedding {
                values: Vec::new(),
                model_version: row.get(4)?,
            },
            reference_image: row.get(5)?,
        };
        Ok((identity, blob))
    }

    // --- video sources ---

    pub fn add_source(&self, new: NewSource) -> Result<SourceRecord, StoreError> {
        let created_at = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO video_sources (name, kind, locator, location, description, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.name,
                new.kind,
                new.locator,
                new.location,
                new.description,
                new.active,
                created_at.timestamp_millis(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(id, name = %new.name, kind = %new.kind, "video source registered");
        Ok(SourceRecord {
            id,
            name: new.name,
            kind: new.kind,
            locator: new.locator,
            location: new.location,
            description: new.description,
            active: new.active,
            created_at: ms_to_datetime(created_at.timestamp_millis())?,
        })
    }

    pub fn source(&self, id: i64) -> Result<SourceRecord, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, name, kind, locator, location, description, active, created_at
                 FROM video_sources WHERE id = ?1",
                params![id],
                Self::row_to_source,
            )
            .optional()?;
        let (record, created_ms) = row.ok_or(StoreError::NotFound { what: "video source", id })?;
        Ok(SourceRecord { created_at: ms_to_datetime(created_ms)?, ..record })
    }

    pub fn list_sources(&self) -> Result<Vec<SourceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, locator, location, description, active, created_at
             FROM video_sources ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::row_to_source)?;
        let mut out = Vec::new();
        for row in rows {
            let (record, created_ms) = row?;
            out.push(SourceRecord { created_at: ms_to_datetime(created_ms)?, ..record });
        }
        Ok(out)
    }

    pub fn set_source_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let updated = self
            .conn()
            .execute("UPDATE video_sources SET active = ?1 WHERE id = ?2", params![active, id])?;
        if updated == 0 {
            return Err(StoreError::NotFound { what: "video source", id });
        }
        Ok(())
    }

    pub fn remove_source(&self, id: i64) -> Result<(), StoreError> {
        let removed = self.conn().execute("DELETE FROM video_sources WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::NotFound { what: "video source", id });
        }
        Ok(())
    }

    fn row_to_source(row: &Row<'_>) -> rusqlite::Result<(SourceRecord, i64)> {
        let record = SourceRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            locator: row.get(3)?,
            location: row.get(4)?,
            description: row.get(5)?,
            active: row.get(6)?,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        };
        Ok((record, row.get(7)?))
    }

    // --- event administration ---

    pub fn delete_event(&self, id: i64) -> Result<(), StoreError> {
        let removed = self.conn().execute("DELETE FROM events WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::NotFound { what: "event", id });
        }
        tracing::info!(id, "event deleted");
        Ok(())
    }

    /// Delete every event; returns how many were removed.
    pub fn delete_all_events(&self) -> Result<usize, StoreError> {
        let removed = self.conn().execute("DELETE FROM events", [])?;
        tracing::info!(removed, "event log cleared");
        Ok(removed)
    }
}

impl GalleryStore for SqliteStore {
    fn load_all_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, display_name, external_code, embedding, model_version, reference_image
             FROM identities ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::row_to_identity)?;
        let mut identities = Vec::new();
        for row in rows {
            let (mut identity, blob) = row?;
            let decoded = Embedding::from_le_bytes(&blob).ok_or_else(|| {
                StoreError::Corrupt(format!("identity {} has a {}-byte embedding", identity.id, blob.len()))
            })?;
            identity.embedding.values = decoded.values;
            identities.push(identity);
        }
        Ok(identities)
    }
}

impl EventLog for SqliteStore {
    fn append(&self, event: &IdentificationEvent) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO events (identity_name, timestamp_ms, source_kind, source_ref, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.identity_name,
                event.timestamp.timestamp_millis(),
                event.source_kind.as_str(),
                event.source_ref,
                event.confidence as f64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn query_recent(&self, identity: Option<&str>, since: DateTime<Utc>) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, identity_name, timestamp_ms, source_kind, source_ref, confidence
             FROM events
             WHERE timestamp_ms >= ?1 AND (?2 IS NULL OR identity_name = ?2)
             ORDER BY timestamp_ms, id",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis(), identity], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, identity_name, ts_ms, kind, source_ref, confidence) = row?;
            let source_kind: SourceKind = kind.parse().map_err(StoreError::Corrupt)?;
            events.push(StoredEvent {
                id,
                event: IdentificationEvent {
                    identity_name,
                    timestamp: ms_to_datetime(ts_ms)?,
                    source_kind,
                    source_ref,
                    confidence: confidence as f32,
                },
            });
        }
        Ok(events)
    }
}
