use rusqlite::Connection;

pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "busy_timeout", 5000i64)?;
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS identities (
  id INTEGER PRIMARY KEY,
  display_name TEXT NOT NULL,
  external_code TEXT NOT NULL UNIQUE,
  embedding BLOB NOT NULL,
  model_version TEXT,
  reference_image TEXT,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS video_sources (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  kind TEXT NOT NULL,
  locator TEXT NOT NULL,
  location TEXT,
  description TEXT,
  active INTEGER NOT NULL DEFAULT 1,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY,
  identity_name TEXT NOT NULL,
  timestamp_ms INTEGER NOT NULL,
  source_kind TEXT NOT NULL,
  source_ref TEXT,
  confidence REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_events_identity ON events(identity_name, timestamp_ms);
    "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        apply_schema(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('identities', 'video_sources', 'events')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
