//! SQLite-backed vector store.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS points (
//!     id         TEXT PRIMARY KEY,
//!     vector     BLOB NOT NULL,   -- bincode Vec<f32>
//!     payload    TEXT NOT NULL,   -- JSON object
//!     checksum   TEXT NOT NULL,   -- CRC-32 of vector || payload
//!     updated_at TEXT NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS records (
//!     id       TEXT PRIMARY KEY,
//!     state    BLOB NOT NULL,     -- bincode RecordSnapshot
//!     checksum TEXT NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! ```
//!
//! A point and its record snapshot are written in one transaction.
//!
//! Search is an exact scan; payload filters run in Rust after decoding.
//! WAL mode allows concurrent readers from other processes.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{check_dimension, rank, score_point, RecordSnapshot, ScoredPoint, StoredPoint, VectorStore};
use crate::error::{Result, SpaceConfigError, StoreError};
use crate::filter::Predicate;
use crate::index::IndexLayout;
use crate::types::RecordId;

const LAYOUT_KEY: &str = "layout";

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS points (
        id         TEXT PRIMARY KEY,
        vector     BLOB NOT NULL,
        payload    TEXT NOT NULL,
        checksum   TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS records (
        id       TEXT PRIMARY KEY,
        state    BLOB NOT NULL,
        checksum TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );";

// ---------------------------------------------------------------------------
// CRC-32 checksum helper
// ---------------------------------------------------------------------------

/// CRC-32 (ISO 3309 polynomial, reflected) over several byte slices, as hex.
fn crc32_hex(parts: &[&[u8]]) -> String {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in parts.iter().flat_map(|p| p.iter()) {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (POLY & mask);
        }
    }
    format!("{:08x}", !crc)
}

fn serialization(e: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(e.to_string())
}

// ---------------------------------------------------------------------------
// SqliteVectorStore
// ---------------------------------------------------------------------------

/// Durable vector store on a single SQLite connection.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    dimensions: Mutex<Option<usize>>,
}

impl std::fmt::Debug for SqliteVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SqliteVectorStore {
    /// Open (or create) a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, wal_mode: bool) -> std::result::Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;

        if wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!(path = %db_path.display(), wal = wal_mode, "SQLite vector store opened");
        Self::from_connection(conn, db_path)
    }

    /// Open a private in-memory database (useful for tests).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failures.
    pub fn open_in_memory() -> std::result::Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, db_path: PathBuf) -> std::result::Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            db_path,
            dimensions: Mutex::new(None),
        };
        *store.dimensions.lock() = store.stored_layout()?.map(|l| l.dimensions());
        Ok(store)
    }

    /// Path to the database file (`:memory:` for in-memory databases).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Copy the database to `dest` with SQLite's online-backup API.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failures.
    pub fn backup<P: AsRef<Path>>(&self, dest: P) -> std::result::Result<(), StoreError> {
        let start = Instant::now();
        let conn = self.conn.lock();
        let mut target = Connection::open(dest.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut target)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(50), None)?;
        info!(
            dest = %dest.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "Vector store backup completed"
        );
        Ok(())
    }

    fn stored_layout(&self) -> std::result::Result<Option<IndexLayout>, StoreError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![LAYOUT_KEY], |row| row.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(serialization)).transpose()
    }

    fn decode(
        id: String,
        blob: &[u8],
        payload: &str,
        checksum: &str,
    ) -> std::result::Result<StoredPoint, StoreError> {
        let id = RecordId(id);
        if crc32_hex(&[blob, payload.as_bytes()]) != checksum {
            warn!(record = %id, "Checksum mismatch, possible store corruption");
            return Err(StoreError::Corrupted(id));
        }
        let vector: Vec<f32> = bincode::deserialize(blob).map_err(serialization)?;
        let payload: Map<String, Value> = serde_json::from_str(payload).map_err(serialization)?;
        Ok(StoredPoint { id, vector, payload })
    }

    fn write_point(conn: &Connection, point: &StoredPoint) -> std::result::Result<(), StoreError> {
        let blob = bincode::serialize(&point.vector).map_err(serialization)?;
        let payload = serde_json::to_string(&point.payload).map_err(serialization)?;
        let checksum = crc32_hex(&[blob.as_slice(), payload.as_bytes()]);
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO points (id, vector, payload, checksum, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                vector = excluded.vector,
                payload = excluded.payload,
                checksum = excluded.checksum,
                updated_at = excluded.updated_at",
            params![point.id.0, blob, payload, checksum, now],
        )?;
        Ok(())
    }
}

impl VectorStore for SqliteVectorStore {
    fn ensure_index(&self, layout: &IndexLayout, override_existing: bool) -> Result<()> {
        if let Some(existing) = self.stored_layout()? {
            if &existing == layout {
                *self.dimensions.lock() = Some(layout.dimensions());
                return Ok(());
            }
            if !override_existing {
                return Err(SpaceConfigError::LayoutMismatch {
                    index: layout.name.clone(),
                    stored: existing.fingerprint(),
                    declared: layout.fingerprint(),
                }
                .into());
            }
            warn!(
                index = %layout.name,
                stored = %existing.fingerprint(),
                declared = %layout.fingerprint(),
                "Index layout changed, dropping stored vectors"
            );
        }

        let json = serde_json::to_string(layout).map_err(serialization)?;
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(StoreError::from)?;
            tx.execute("DELETE FROM points", []).map_err(StoreError::from)?;
            tx.execute("DELETE FROM records", []).map_err(StoreError::from)?;
            tx.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![LAYOUT_KEY, json],
            )
            .map_err(StoreError::from)?;
            tx.commit().map_err(StoreError::from)?;
        }
        *self.dimensions.lock() = Some(layout.dimensions());
        Ok(())
    }

    fn upsert(&self, point: StoredPoint) -> std::result::Result<(), StoreError> {
        check_dimension(*self.dimensions.lock(), point.vector.len())?;
        Self::write_point(&self.conn.lock(), &point)
    }

    fn upsert_record(&self, point: StoredPoint, snapshot: &RecordSnapshot) -> std::result::Result<(), StoreError> {
        check_dimension(*self.dimensions.lock(), point.vector.len())?;
        let state = bincode::serialize(snapshot).map_err(serialization)?;
        let checksum = crc32_hex(&[state.as_slice()]);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::write_point(&tx, &point)?;
        tx.execute(
            "INSERT INTO records (id, state, checksum) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                checksum = excluded.checksum",
            params![point.id.0, state, checksum],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: &RecordId) -> std::result::Result<Option<StoredPoint>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT vector, payload, checksum FROM points WHERE id = ?1")?;
        let row: Option<(Vec<u8>, String, String)> = stmt
            .query_row(params![id.0], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .optional()?;
        row.map(|(blob, payload, checksum)| Self::decode(id.0.clone(), &blob, &payload, &checksum))
            .transpose()
    }

    fn load_snapshot(&self, id: &RecordId) -> std::result::Result<Option<RecordSnapshot>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT state, checksum FROM records WHERE id = ?1")?;
        let row: Option<(Vec<u8>, String)> = stmt
            .query_row(params![id.0], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((state, checksum)) = row else {
            return Ok(None);
        };
        if crc32_hex(&[state.as_slice()]) != checksum {
            warn!(record = %id, "Snapshot checksum mismatch, possible store corruption");
            return Err(StoreError::Corrupted(id.clone()));
        }
        bincode::deserialize(&state).map(Some).map_err(serialization)
    }

    fn search(
        &self,
        query: &[f32],
        filter: Option<&Predicate>,
        limit: usize,
    ) -> std::result::Result<Vec<ScoredPoint>, StoreError> {
        check_dimension(*self.dimensions.lock(), query.len())?;
        let start = Instant::now();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT id, vector, payload, checksum FROM points")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut hits = Vec::new();
        let mut scanned = 0_usize;
        for row in rows {
            let (id, blob, payload, checksum) = row?;
            let point = Self::decode(id, &blob, &payload, &checksum)?;
            scanned += 1;
            if let Some(hit) = score_point(&point, query, filter) {
                hits.push(hit);
            }
        }

        debug!(
            scanned,
            matched = hits.len(),
            elapsed_us = start.elapsed().as_micros(),
            "SQLite search"
        );
        Ok(rank(hits, limit))
    }

    fn len(&self) -> std::result::Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM points", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
