//! SQLite-backed event journal and checkpoint store.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    core::store::{RecordStore, StoreSnapshot},
    event::{EVENT_FORMAT_VERSION, EventEnvelope, MutationEvent},
    feed::{FeedResult, FeedSource},
    types::{EntityType, Offset, Operation},
};

use super::{CheckpointStore, PersistError, PersistResult};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    format_version: u16,
    snapshot: StoreSnapshot,
}

/// One `events` row. `decoded` holds the envelope decode failure, if any.
struct JournalRow {
    entity_type: EntityType,
    offset: Offset,
    ts_ms: u64,
    op: Option<Operation>,
    entity_id: String,
    decoded: Result<MutationEvent, String>,
}

impl JournalRow {
    /// The stored event, or a payload-less stand-in built from the row's
    /// columns. A stand-in for a create or update is refused downstream.
    fn into_feed_event(self) -> MutationEvent {
        match self.decoded {
            Ok(event) => event,
            Err(reason) => {
                warn!(
                    entity_type = %self.entity_type,
                    offset = self.offset,
                    entity_id = %self.entity_id,
                    %reason,
                    "serving undecodable journal row without payload"
                );
                MutationEvent {
                    entity_type: self.entity_type,
                    entity_id: self.entity_id,
                    offset: self.offset,
                    ts_ms: self.ts_ms,
                    op: self.op.unwrap_or(Operation::Update),
                    payload: None,
                }
            }
        }
    }

    fn into_replay_event(self) -> PersistResult<MutationEvent> {
        self.decoded.map_err(|reason| {
            PersistError::Message(format!(
                "{} event at offset {} cannot be replayed: {reason}",
                self.entity_type, self.offset
            ))
        })
    }
}

/// Append-only journal of mutation events, readable as a polled change feed.
///
/// Besides the events it keeps the highest offset ever appended per entity
/// type, which compaction never removes, and optional store snapshots.
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    /// Opens or creates a journal at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory journal.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Appends events in one transaction and returns the highest offset
    /// written. A duplicate `(entity_type, offset)` aborts the whole batch.
    pub fn append_events(&self, events: &[MutationEvent]) -> PersistResult<Offset> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut highest = 0;
        {
            let mut insert = tx.prepare(
                "INSERT INTO events(entity_type, seq, ts_ms, op, entity_id, payload) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut bump_head = tx.prepare(
                "INSERT INTO journal_heads(entity_type, last_offset) VALUES (?1, ?2)
                 ON CONFLICT(entity_type) DO UPDATE SET
                    last_offset = MAX(journal_heads.last_offset, excluded.last_offset)",
            )?;
            for event in events {
                let payload = serde_json::to_vec(&EventEnvelope::new(event.clone()))?;
                insert.execute(params![
                    event.entity_type.as_str(),
                    event.offset as i64,
                    event.ts_ms as i64,
                    op_code(event.op),
                    event.entity_id,
                    payload,
                ])?;
                bump_head.execute(params![event.entity_type.as_str(), event.offset as i64])?;
                highest = highest.max(event.offset);
            }
        }
        tx.commit()?;
        Ok(highest)
    }

    /// Loads up to `limit` events of `entity_type` strictly after `offset`.
    ///
    /// A row whose payload cannot be decoded is returned without payload so
    /// that readers can skip it instead of stalling on it.
    pub fn load_events_after(
        &self,
        entity_type: EntityType,
        offset: Offset,
        limit: usize,
    ) -> PersistResult<Vec<MutationEvent>> {
        let rows = self.load_rows_after(entity_type, offset, limit)?;
        Ok(rows.into_iter().map(JournalRow::into_feed_event).collect())
    }

    fn load_rows_after(
        &self,
        entity_type: EntityType,
        offset: Offset,
        limit: usize,
    ) -> PersistResult<Vec<JournalRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, ts_ms, op, entity_id, payload FROM events
             WHERE entity_type = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
        )?;

        let rows = stmt.query_map(
            params![entity_type.as_str(), offset as i64, limit.min(i64::MAX as usize) as i64],
            |row| {
                let seq: i64 = row.get(0)?;
                let ts_ms: i64 = row.get(1)?;
                let op: i64 = row.get(2)?;
                let entity_id: String = row.get(3)?;
                let payload: Vec<u8> = row.get(4)?;
                let offset = seq as Offset;
                let decoded = decode_event_payload(&payload).and_then(|event| {
                    if event.entity_type != entity_type || event.offset != offset {
                        return Err(format!(
                            "envelope holds {} offset {}, row is {entity_type} offset {offset}",
                            event.entity_type, event.offset
                        ));
                    }
                    Ok(event)
                });
                Ok(JournalRow {
                    entity_type,
                    offset,
                    ts_ms: ts_ms as u64,
                    op: op_from_code(op),
                    entity_id,
                    decoded,
                })
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Highest offset ever journaled for `entity_type`, 0 when none.
    ///
    /// Survives compaction of the events themselves.
    pub fn latest_offset(&self, entity_type: EntityType) -> PersistResult<Offset> {
        latest_offset(&self.conn.lock(), entity_type)
    }

    /// Stores `snapshot` as the new replay base.
    ///
    /// Refused when the snapshot claims offsets the journal does not hold,
    /// i.e. the store still had events that were never appended.
    pub fn write_snapshot(&self, snapshot: &StoreSnapshot) -> PersistResult<()> {
        let conn = self.conn.lock();
        for entity_type in EntityType::ALL {
            let head = snapshot.head(entity_type);
            let journaled = latest_offset(&conn, entity_type)?;
            if head > journaled {
                return Err(PersistError::Message(format!(
                    "snapshot covers {entity_type} offset {head} but the journal ends at {journaled}"
                )));
            }
        }

        let env = SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot: snapshot.clone(),
        };
        let payload = serde_json::to_vec(&env)?;
        conn.execute(
            "INSERT INTO snapshots(ts_ms, payload) VALUES (?1, ?2)",
            params![now_ms() as i64, payload],
        )?;
        Ok(())
    }

    /// Deletes events of `entity_type` up to and including `offset`.
    ///
    /// Requires a snapshot covering `offset`, so that [`Self::load_store`]
    /// still sees the compacted records. Only safe once every consumer's
    /// checkpoint is at or past `offset`.
    pub fn compact_through(&self, entity_type: EntityType, offset: Offset) -> PersistResult<usize> {
        let conn = self.conn.lock();
        let covered = load_latest_snapshot(&conn)?
            .map(|snapshot| snapshot.head(entity_type))
            .unwrap_or(0);
        if covered < offset {
            return Err(PersistError::Message(format!(
                "cannot compact {entity_type} through {offset}: latest snapshot covers {covered}"
            )));
        }

        let count = conn.execute(
            "DELETE FROM events WHERE entity_type = ?1 AND seq <= ?2",
            params![entity_type.as_str(), offset as i64],
        )?;
        Ok(count)
    }

    /// Rebuilds a record store from the latest snapshot plus the events
    /// after it, so that new writes continue the journal's offsets.
    ///
    /// Fails on any row that cannot be decoded.
    pub fn load_store(&self) -> PersistResult<RecordStore> {
        let snapshot = load_latest_snapshot(&self.conn.lock())?;
        let starts: Vec<(EntityType, Offset)> = EntityType::ALL
            .into_iter()
            .map(|et| (et, snapshot.as_ref().map_or(0, |s| s.head(et))))
            .collect();
        let mut store = snapshot.map(RecordStore::from_snapshot).unwrap_or_default();

        for (entity_type, mut after) in starts {
            loop {
                let rows = self.load_rows_after(entity_type, after, 1024)?;
                let Some(last) = rows.last() else {
                    break;
                };
                after = last.offset;
                for row in rows {
                    store.apply_replayed_event(&row.into_replay_event()?)?;
                }
            }
            store.continue_from(entity_type, self.latest_offset(entity_type)?);
        }
        Ok(store)
    }
}

impl FeedSource for SqliteJournal {
    fn fetch_after(&self, entity_type: EntityType, after: Offset, limit: usize) -> FeedResult<Vec<MutationEvent>> {
        Ok(self.load_events_after(entity_type, after, limit)?)
    }
}

/// Durable checkpoint store. Writes use `synchronous=FULL` and never move a
/// checkpoint backwards.
pub struct SqliteCheckpointStore {
    conn: Connection,
}

impl SqliteCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Ok(Self { conn })
    }

    /// Every stored checkpoint, ordered by entity type name.
    pub fn all(&self) -> PersistResult<Vec<(EntityType, Offset)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_type, last_offset FROM checkpoints ORDER BY entity_type ASC")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let offset: i64 = row.get(1)?;
            Ok((name, offset))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (name, offset) = row?;
            let entity_type = name
                .parse::<EntityType>()
                .map_err(|e| PersistError::Message(e.to_string()))?;
            out.push((entity_type, offset as Offset));
        }
        Ok(out)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&mut self, entity_type: EntityType) -> PersistResult<Option<Offset>> {
        let offset: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_offset FROM checkpoints WHERE entity_type = ?1",
                params![entity_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.map(|v| v as Offset))
    }

    fn save(&mut self, entity_type: EntityType, offset: Offset) -> PersistResult<()> {
        self.conn.execute(
            "INSERT INTO checkpoints(entity_type, last_offset, updated_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_type) DO UPDATE SET
                last_offset = MAX(checkpoints.last_offset, excluded.last_offset),
                updated_ms = excluded.updated_ms",
            params![entity_type.as_str(), offset as i64, now_ms() as i64],
        )?;
        Ok(())
    }
}

fn op_code(op: Operation) -> i64 {
    match op {
        Operation::Create => 1,
        Operation::Update => 2,
        Operation::Delete => 3,
    }
}

fn op_from_code(code: i64) -> Option<Operation> {
    match code {
        1 => Some(Operation::Create),
        2 => Some(Operation::Update),
        3 => Some(Operation::Delete),
        _ => None,
    }
}

fn latest_offset(conn: &Connection, entity_type: EntityType) -> PersistResult<Offset> {
    let seq: Option<i64> = conn
        .query_row(
            "SELECT MAX(last) FROM (
                SELECT MAX(seq) AS last FROM events WHERE entity_type = ?1
                UNION ALL
                SELECT last_offset FROM journal_heads WHERE entity_type = ?1
             )",
            params![entity_type.as_str()],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(seq.unwrap_or(0) as Offset)
}

fn load_latest_snapshot(conn: &Connection) -> PersistResult<Option<StoreSnapshot>> {
    let payload: Option<Vec<u8>> = conn
        .query_row(
            "SELECT payload FROM snapshots ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let Some(payload) = payload else {
        return Ok(None);
    };

    let env: SnapshotEnvelope = serde_json::from_slice(&payload)?;
    if env.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(PersistError::Message(format!(
            "unsupported snapshot format version: {}",
            env.format_version
        )));
    }
    Ok(Some(env.snapshot))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn decode_event_payload(payload: &[u8]) -> Result<MutationEvent, String> {
    let envelope = serde_json::from_slice::<EventEnvelope>(payload)
        .map_err(|e| format!("event payload decode failed: {e}"))?;
    if envelope.format_version != EVENT_FORMAT_VERSION {
        return Err(format!(
            "unsupported event format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.event)
}
