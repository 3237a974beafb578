//! Persistence of load records and bus sightings: SQLite and in-memory stores.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::PollError;
use crate::forecast::SeriesPoint;
use crate::model::{BoundingBox, BusSighting, LoadRecord, StopId};
use crate::open_db_connection;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const HOUR_MS: i64 = 3_600_000;

/// A persisted load record with its row id.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredLoad {
    pub id: i64,
    #[serde(flatten)]
    pub record: LoadRecord,
}

/// Append-only store for load records and bus sightings.
pub trait ResultStore: Send {
    /// Write one record and its sightings atomically. Returns the record id.
    /// Sightings already present (same sighting key) are skipped.
    fn insert_observation(&mut self, record: &LoadRecord, sightings: &[BusSighting]) -> Result<i64>;

    fn latest_load(&mut self, stop_id: StopId) -> Result<Option<StoredLoad>>;

    /// Sightings with a recognized identifier detected at or after `since_ms`.
    fn recent_sightings(&mut self, stop_id: StopId, since_ms: i64) -> Result<Vec<BusSighting>>;

    /// Mean people count per hour since `since_ms`, oldest first.
    fn hourly_people_series(&mut self, stop_id: StopId, since_ms: i64) -> Result<Vec<SeriesPoint>>;

    /// People count of the latest record, 0 when the stop has none.
    fn last_people_count(&mut self, stop_id: StopId) -> Result<u32> {
        Ok(self
            .latest_load(stop_id)?
            .map(|stored| stored.record.people_count)
            .unwrap_or(0))
    }
}

/// Opens a fresh store handle per task. Handles are never shared across tasks.
pub trait StoreFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn ResultStore>>;
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteResultStore {
    conn: Connection,
}

impl SqliteResultStore {
    /// Connect and create the schema if it is missing.
    pub fn open(db_path: &str) -> Result<Self> {
        let mut store = Self::connect(db_path)?;
        store.ensure_schema()?;
        Ok(store)
    }

    /// Connect to a database whose schema already exists.
    pub fn connect(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS load_records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              stop_id INTEGER NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              people_count INTEGER NOT NULL,
              bus_count INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bus_sightings (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              load_record_id INTEGER NOT NULL REFERENCES load_records(id),
              stop_id INTEGER NOT NULL,
              detected_at_ms INTEGER NOT NULL,
              recognized_id TEXT,
              confidence REAL NOT NULL,
              bbox_json TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              sighting_key TEXT NOT NULL UNIQUE
            );

            CREATE INDEX IF NOT EXISTS idx_load_stop_time ON load_records(stop_id, timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_sightings_stop_time ON bus_sightings(stop_id, detected_at_ms);
            "#,
        )?;
        Ok(())
    }

    pub fn count_load_records(&self, stop_id: StopId) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM load_records WHERE stop_id = ?1",
            params![stop_id],
            |row| row.get(0),
        )?)
    }

    pub fn count_sightings(&self, stop_id: StopId) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM bus_sightings WHERE stop_id = ?1",
            params![stop_id],
            |row| row.get(0),
        )?)
    }
}

impl ResultStore for SqliteResultStore {
    fn insert_observation(&mut self, record: &LoadRecord, sightings: &[BusSighting]) -> Result<i64> {
        let tx = self.conn.transaction().context("begin observation transaction")?;
        tx.execute(
            r#"
            INSERT INTO load_records(stop_id, timestamp_ms, people_count, bus_count, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.stop_id,
                record.timestamp_ms,
                record.people_count,
                record.bus_count,
                serde_json::to_string(&record.payload)?
            ],
        )
        .context("insert load record")?;
        let record_id = tx.last_insert_rowid();

        for sighting in sightings {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO bus_sightings(
                  load_record_id, stop_id, detected_at_ms, recognized_id,
                  confidence, bbox_json, payload_json, sighting_key)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record_id,
                    sighting.stop_id,
                    sighting.detected_at_ms,
                    sighting.recognized_id,
                    sighting.confidence as f64,
                    serde_json::to_string(&sighting.bbox)?,
                    serde_json::to_string(&sighting.payload)?,
                    sighting.sighting_key()
                ],
            )
            .context("insert bus sighting")?;
        }

        tx.commit().context("commit observation")?;
        Ok(record_id)
    }

    fn latest_load(&mut self, stop_id: StopId) -> Result<Option<StoredLoad>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, timestamp_ms, people_count, bus_count, payload_json
                FROM load_records WHERE stop_id = ?1
                ORDER BY timestamp_ms DESC, id DESC LIMIT 1
                "#,
                params![stop_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, timestamp_ms, people_count, bus_count, payload_json)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredLoad {
            id,
            record: LoadRecord {
                stop_id,
                timestamp_ms,
                people_count,
                bus_count,
                payload: serde_json::from_str(&payload_json)?,
            },
        }))
    }

    fn recent_sightings(&mut self, stop_id: StopId, since_ms: i64) -> Result<Vec<BusSighting>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT detected_at_ms, recognized_id, confidence, bbox_json, payload_json
                FROM bus_sightings
                WHERE stop_id = ?1 AND detected_at_ms >= ?2 AND recognized_id IS NOT NULL
                ORDER BY detected_at_ms DESC
                "#,
            )?;
            let mut rows = stmt.query(params![stop_id, since_ms])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ));
            }
            out
        };

        rows.into_iter()
            .map(|(detected_at_ms, recognized_id, confidence, bbox_json, payload_json)| {
                let bbox: BoundingBox = serde_json::from_str(&bbox_json)
                    .map_err(|e| anyhow!("corrupt sighting bbox: {}", e))?;
                Ok(BusSighting {
                    stop_id,
                    detected_at_ms,
                    recognized_id,
                    confidence: confidence as f32,
                    bbox,
                    payload: serde_json::from_str(&payload_json)?,
                })
            })
            .collect()
    }

    fn hourly_people_series(&mut self, stop_id: StopId, since_ms: i64) -> Result<Vec<SeriesPoint>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT (timestamp_ms / ?3) * ?3 AS hour_ms, AVG(people_count)
            FROM load_records
            WHERE stop_id = ?1 AND timestamp_ms >= ?2
            GROUP BY hour_ms ORDER BY hour_ms ASC
            "#,
        )?;
        let mut rows = stmt.query(params![stop_id, since_ms, HOUR_MS])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(SeriesPoint {
                timestamp_ms: row.get(0)?,
                value: row.get(1)?,
            });
        }
        Ok(out)
    }
}

#[derive(Clone, Debug)]
pub struct SqliteStoreFactory {
    db_path: String,
}

impl SqliteStoreFactory {
    /// Creates the schema once; per-task opens only connect.
    pub fn new(db_path: impl Into<String>) -> Result<Self> {
        let db_path = db_path.into();
        SqliteResultStore::open(&db_path)
            .with_context(|| format!("initialize result store at {}", db_path))?;
        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }
}

impl StoreFactory for SqliteStoreFactory {
    fn open(&self) -> Result<Box<dyn ResultStore>> {
        Ok(Box::new(SqliteResultStore::connect(&self.db_path)?))
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct InMemoryLoadEntry {
    id: i64,
    record: LoadRecord,
}

#[derive(Clone, Debug, Default)]
struct InMemoryState {
    loads: Vec<InMemoryLoadEntry>,
    sightings: Vec<(String, BusSighting)>,
}

/// Shared in-memory store. Clones see the same data; each clone acts as its
/// own handle, so it doubles as its own `StoreFactory`.
#[derive(Clone, Debug, Default)]
pub struct InMemoryResultStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn load_records(&self) -> Vec<LoadRecord> {
        self.state()
            .loads
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn sightings(&self) -> Vec<BusSighting> {
        self.state()
            .sightings
            .iter()
            .map(|(_, sighting)| sighting.clone())
            .collect()
    }
}

impl ResultStore for InMemoryResultStore {
    fn insert_observation(&mut self, record: &LoadRecord, sightings: &[BusSighting]) -> Result<i64> {
        let mut state = self.state();
        let id = state.loads.last().map(|entry| entry.id + 1).unwrap_or(1);
        state.loads.push(InMemoryLoadEntry {
            id,
            record: record.clone(),
        });
        for sighting in sightings {
            let key = sighting.sighting_key();
            if !state.sightings.iter().any(|(existing, _)| *existing == key) {
                state.sightings.push((key, sighting.clone()));
            }
        }
        Ok(id)
    }

    fn latest_load(&mut self, stop_id: StopId) -> Result<Option<StoredLoad>> {
        Ok(self
            .state()
            .loads
            .iter()
            .filter(|entry| entry.record.stop_id == stop_id)
            .max_by_key(|entry| (entry.record.timestamp_ms, entry.id))
            .map(|entry| StoredLoad {
                id: entry.id,
                record: entry.record.clone(),
            }))
    }

    fn recent_sightings(&mut self, stop_id: StopId, since_ms: i64) -> Result<Vec<BusSighting>> {
        let mut out: Vec<BusSighting> = self
            .state()
            .sightings
            .iter()
            .map(|(_, sighting)| sighting)
            .filter(|s| s.stop_id == stop_id && s.detected_at_ms >= since_ms)
            .filter(|s| s.recognized_id.is_some())
            .cloned()
            .collect();
        out.sort_by_key(|s| std::cmp::Reverse(s.detected_at_ms));
        Ok(out)
    }

    fn hourly_people_series(&mut self, stop_id: StopId, since_ms: i64) -> Result<Vec<SeriesPoint>> {
        let mut buckets: std::collections::BTreeMap<i64, (f64, u32)> = Default::default();
        for entry in self.state().loads.iter() {
            let record = &entry.record;
            if record.stop_id != stop_id || record.timestamp_ms < since_ms {
                continue;
            }
            let hour = (record.timestamp_ms / HOUR_MS) * HOUR_MS;
            let slot = buckets.entry(hour).or_insert((0.0, 0));
            slot.0 += record.people_count as f64;
            slot.1 += 1;
        }
        Ok(buckets
            .into_iter()
            .map(|(timestamp_ms, (sum, n))| SeriesPoint {
                timestamp_ms,
                value: sum / n as f64,
            })
            .collect())
    }
}

impl StoreFactory for InMemoryResultStore {
    fn open(&self) -> Result<Box<dyn ResultStore>> {
        Ok(Box::new(self.clone()))
    }
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

/// Persists poll results. Every task gets its own store handle.
#[derive(Clone)]
pub struct ResultWriter {
    factory: Arc<dyn StoreFactory>,
}

impl ResultWriter {
    pub fn new(factory: Arc<dyn StoreFactory>) -> Self {
        Self { factory }
    }

    pub fn begin(&self) -> Result<WriterSession, PollError> {
        let store = self
            .factory
            .open()
            .context("open result store")
            .map_err(PollError::PersistenceError)?;
        Ok(WriterSession { store })
    }

    /// Write one record with its sightings in a single transaction.
    pub fn write(&self, record: &LoadRecord, sightings: &[BusSighting]) -> Result<i64, PollError> {
        self.begin()?.commit(record, sightings)
    }

    /// Read-side access for the HTTP surface and diagnostics.
    pub fn open_store(&self) -> Result<Box<dyn ResultStore>> {
        self.factory.open()
    }
}

/// One task's exclusive handle on the store.
pub struct WriterSession {
    store: Box<dyn ResultStore>,
}

impl WriterSession {
    pub fn people_before(&mut self, stop_id: StopId) -> Result<u32, PollError> {
        self.store
            .last_people_count(stop_id)
            .context("read previous people count")
            .map_err(PollError::PersistenceError)
    }

    pub fn commit(mut self, record: &LoadRecord, sightings: &[BusSighting]) -> Result<i64, PollError> {
        self.store
            .insert_observation(record, sightings)
            .with_context(|| format!("persist observation for stop {}", record.stop_id))
            .map_err(PollError::PersistenceError)
    }
}
