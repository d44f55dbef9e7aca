// ABOUTME: Durable per-scope "last seen" watermarks for unread-message reconciliation
// ABOUTME: Advances are monotonic; a stale advance is reported as Ignored, never applied
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Result of an advance attempt. `Ignored` is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    Advanced { previous: Option<u64> },
    Ignored { current: u64 },
}

impl AdvanceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "advanced",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// One stored watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatermarkRecord {
    pub scope_key: String,
    pub last_seen_id: u64,
    pub updated_at: String,
}

/// Storage seam for watermarks.
///
/// `advance` must be atomic per key: after it returns, the stored value is the
/// maximum of every id ever passed for that key.
pub trait WatermarkStore: Send + Sync {
    fn load(&self, scope_key: &str) -> Result<Option<u64>>;
    fn advance(&self, scope_key: &str, id: u64) -> Result<AdvanceOutcome>;
    fn list(&self) -> Result<Vec<WatermarkRecord>>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    entries: Mutex<HashMap<String, (u64, String)>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn load(&self, scope_key: &str) -> Result<Option<u64>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Watermark mutex poisoned: {}", e))?;
        Ok(entries.get(scope_key).map(|(id, _)| *id))
    }

    fn advance(&self, scope_key: &str, id: u64) -> Result<AdvanceOutcome> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Watermark mutex poisoned: {}", e))?;
        let previous = entries.get(scope_key).map(|(current, _)| *current);
        match previous {
            Some(current) if id <= current => Ok(AdvanceOutcome::Ignored { current }),
            _ => {
                entries.insert(scope_key.to_string(), (id, chrono::Utc::now().to_rfc3339()));
                Ok(AdvanceOutcome::Advanced { previous })
            }
        }
    }

    fn list(&self) -> Result<Vec<WatermarkRecord>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Watermark mutex poisoned: {}", e))?;
        let mut records: Vec<WatermarkRecord> = entries
            .iter()
            .map(|(key, (id, updated_at))| WatermarkRecord {
                scope_key: key.clone(),
                last_seen_id: *id,
                updated_at: updated_at.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.scope_key.cmp(&b.scope_key));
        Ok(records)
    }
}

// =============================================================================
// SQLite store
// =============================================================================

/// SQLite-backed store. Ids are stored as INTEGER, so they must fit in an i64.
#[derive(Clone)]
pub struct SqliteWatermarkStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteWatermarkStore {
    /// Open (or create) `watermarks.db` inside `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        let db_path = data_dir.join("watermarks.db");
        let conn = Connection::open(&db_path).context("Failed to open SQLite database")?;
        let store = Self::from_connection(conn)?;
        tracing::info!(db = %db_path.display(), "Watermark store initialized");
        Ok(store)
    }

    /// Wrap an existing connection (e.g. `Connection::open_in_memory()`).
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS watermarks (
                scope_key TEXT PRIMARY KEY,
                last_seen_id INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

/// SQLite integers are signed. Flipping the top bit maps the full `u64`
/// range onto `i64` while keeping the order, so SQL comparisons stay valid.
const SIGN_BIT: u64 = 1 << 63;

fn to_sql_id(id: u64) -> i64 {
    (id ^ SIGN_BIT) as i64
}

fn from_sql_id(stored: i64) -> u64 {
    (stored as u64) ^ SIGN_BIT
}

impl WatermarkStore for SqliteWatermarkStore {
    fn load(&self, scope_key: &str) -> Result<Option<u64>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let stored: Option<i64> = db
            .query_row(
                "SELECT last_seen_id FROM watermarks WHERE scope_key = ?1",
                params![scope_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.map(from_sql_id))
    }

    fn advance(&self, scope_key: &str, id: u64) -> Result<AdvanceOutcome> {
        let value = to_sql_id(id);
        let mut db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let tx = db.transaction()?;

        let previous: Option<i64> = tx
            .query_row(
                "SELECT last_seen_id FROM watermarks WHERE scope_key = ?1",
                params![scope_key],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match previous {
            Some(current) if value <= current => AdvanceOutcome::Ignored {
                current: from_sql_id(current),
            },
            _ => {
                tx.execute(
                    "INSERT INTO watermarks (scope_key, last_seen_id, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(scope_key) DO UPDATE SET
                        last_seen_id = excluded.last_seen_id,
                        updated_at = excluded.updated_at
                     WHERE excluded.last_seen_id > watermarks.last_seen_id",
                    params![scope_key, value, chrono::Utc::now().to_rfc3339()],
                )?;
                AdvanceOutcome::Advanced {
                    previous: previous.map(from_sql_id),
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn list(&self) -> Result<Vec<WatermarkRecord>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(
            "SELECT scope_key, last_seen_id, updated_at FROM watermarks ORDER BY scope_key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (scope_key, last_seen_id, updated_at) = row?;
            records.push(WatermarkRecord {
                scope_key,
                last_seen_id: from_sql_id(last_seen_id),
                updated_at,
            });
        }
        Ok(records)
    }
}
