//! Durable SQLite event store backend.
//!
//! # Schema
//! - `events`: one row per committed event; `global_position` is the rowid,
//!   `(stream_id, event_number)` is unique.
//! - `stream_state`: current length per stream, the optimistic-concurrency
//!   check target.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON.  `PRAGMA integrity_check` runs at open; returns an error
//! if it fails.
//!
//! The connection is shared behind a lock and driven from
//! `spawn_blocking`; the `subscribe_all` broadcast is fed post-commit while
//! the connection lock is still held, so broadcast order equals commit
//! order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{EventStore, EventStoreError};
use crate::types::{EventNumber, EventPayload, RecordedEvent, StreamId, StreamPosition};

const SUBSCRIBE_ALL_CAPACITY: usize = 1024;
const READ_PAGE: usize = 256;

/// A durable [`EventStore`] over a single SQLite database file.
#[derive(Clone)]
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
    tx: broadcast::Sender<RecordedEvent>,
}

impl SqliteEventStore {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables if
    /// needed.
    pub fn open(path: &Path) -> Result<Self, EventStoreError> {
        let conn = Connection::open(path).map_err(sqlite_error)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        let (tx, _rx) = broadcast::channel(SUBSCRIBE_ALL_CAPACITY);
        Ok(SqliteEventStore {
            conn: Arc::new(Mutex::new(conn)),
            tx,
        })
    }
}

fn sqlite_error(e: rusqlite::Error) -> EventStoreError {
    EventStoreError::backend(format!("sqlite: {e}"))
}

fn apply_pragmas(conn: &Connection) -> Result<(), EventStoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )
    .map_err(sqlite_error)
}

fn run_integrity_check(conn: &Connection) -> Result<(), EventStoreError> {
    let result: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .map_err(sqlite_error)?;
    if result == "ok" {
        Ok(())
    } else {
        Err(EventStoreError::backend(format!(
            "integrity check failed: {result}"
        )))
    }
}

fn apply_schema(conn: &Connection) -> Result<(), EventStoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
             global_position INTEGER PRIMARY KEY AUTOINCREMENT,
             stream_id       TEXT NOT NULL,
             event_number    INTEGER NOT NULL,
             event_type      TEXT NOT NULL,
             data            TEXT NOT NULL,
             metadata        TEXT,
             committed_at    TEXT NOT NULL,
             UNIQUE (stream_id, event_number)
         );
         CREATE TABLE IF NOT EXISTS stream_state (
             stream_id TEXT PRIMARY KEY,
             length    INTEGER NOT NULL
         );",
    )
    .map_err(sqlite_error)
}

fn stream_length(conn: &Connection, stream_id: &StreamId) -> Result<EventNumber, EventStoreError> {
    let length: Option<i64> = conn
        .query_row(
            "SELECT length FROM stream_state WHERE stream_id = ?1",
            params![stream_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(sqlite_error)?;
    Ok(length.unwrap_or(0) as u64)
}

fn append_blocking(
    conn: &Arc<Mutex<Connection>>,
    bus_tx: &broadcast::Sender<RecordedEvent>,
    expected: StreamPosition,
    events: Vec<EventPayload>,
) -> Result<StreamPosition, EventStoreError> {
    let mut conn = conn.lock();
    let db_tx = conn.transaction().map_err(sqlite_error)?;

    let actual = stream_length(&db_tx, &expected.stream_id)?;
    if actual != expected.event_number {
        return Err(EventStoreError::ConcurrencyConflict {
            stream_id: expected.stream_id,
            expected: expected.event_number,
            actual,
        });
    }
    if events.is_empty() {
        return Ok(expected);
    }

    let committed_at = Utc::now().to_rfc3339();
    let mut recorded = Vec::with_capacity(events.len());
    for (index, payload) in events.into_iter().enumerate() {
        let event_number = expected.event_number + index as u64;
        let data = serde_json::to_string(&payload.data)
            .map_err(|e| EventStoreError::backend(format!("unserializable payload: {e}")))?;
        let metadata = payload
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| EventStoreError::backend(format!("unserializable metadata: {e}")))?;
        db_tx
            .execute(
                "INSERT INTO events
                     (stream_id, event_number, event_type, data, metadata, committed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    expected.stream_id.as_str(),
                    event_number as i64,
                    payload.event_type,
                    data,
                    metadata,
                    committed_at
                ],
            )
            .map_err(sqlite_error)?;
        recorded.push(RecordedEvent {
            stream_id: expected.stream_id.clone(),
            event_number,
            global_position: db_tx.last_insert_rowid() as u64,
            payload,
        });
    }

    let next = expected.event_number + recorded.len() as u64;
    db_tx
        .execute(
            "INSERT INTO stream_state (stream_id, length) VALUES (?1, ?2)
             ON CONFLICT(stream_id) DO UPDATE SET length = ?2",
            params![expected.stream_id.as_str(), next as i64],
        )
        .map_err(sqlite_error)?;
    db_tx.commit().map_err(sqlite_error)?;

    // Publish while still holding the connection lock: commit order and
    // broadcast order coincide.
    for event in recorded {
        let _ = bus_tx.send(event);
    }
    Ok(StreamPosition::new(expected.stream_id, next))
}

fn fetch_page(
    conn: &Arc<Mutex<Connection>>,
    stream_id: &StreamId,
    from: EventNumber,
    limit: usize,
) -> Result<Vec<RecordedEvent>, EventStoreError> {
    let conn = conn.lock();
    let mut statement = conn
        .prepare(
            "SELECT global_position, event_number, event_type, data, metadata
             FROM events
             WHERE stream_id = ?1 AND event_number >= ?2
             ORDER BY event_number
             LIMIT ?3",
        )
        .map_err(sqlite_error)?;
    let rows = statement
        .query_map(
            params![stream_id.as_str(), from as i64, limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .map_err(sqlite_error)?;

    let mut page = Vec::new();
    for row in rows {
        let (global_position, event_number, event_type, data, metadata) =
            row.map_err(sqlite_error)?;
        let data = serde_json::from_str(&data)
            .map_err(|e| EventStoreError::backend(format!("corrupt event data: {e}")))?;
        let metadata = metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| EventStoreError::backend(format!("corrupt event metadata: {e}")))?;
        page.push(RecordedEvent {
            stream_id: stream_id.clone(),
            event_number: event_number as u64,
            global_position: global_position as u64,
            payload: EventPayload {
                event_type,
                data,
                metadata,
            },
        });
    }
    Ok(page)
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(
        &self,
        expected: StreamPosition,
        events: Vec<EventPayload>,
    ) -> Result<StreamPosition, EventStoreError> {
        let conn = self.conn.clone();
        let bus_tx = self.tx.clone();
        tokio::task::spawn_blocking(move || append_blocking(&conn, &bus_tx, expected, events))
            .await
            .map_err(|e| EventStoreError::backend(format!("append task failed: {e}")))?
    }

    fn read(
        &self,
        from: StreamPosition,
    ) -> BoxStream<'static, Result<RecordedEvent, EventStoreError>> {
        let conn = self.conn.clone();
        Box::pin(async_stream::stream! {
            let mut next = from.event_number;
            loop {
                let page_conn = conn.clone();
                let stream_id = from.stream_id.clone();
                let page = tokio::task::spawn_blocking(move || {
                    fetch_page(&page_conn, &stream_id, next, READ_PAGE)
                })
                .await;
                let page = match page {
                    Ok(Ok(page)) => page,
                    Ok(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    Err(e) => {
                        yield Err(EventStoreError::backend(format!("read task failed: {e}")));
                        return;
                    }
                };
                let count = page.len();
                for event in page {
                    next = event.event_number + 1;
                    yield Ok(event);
                }
                if count < READ_PAGE {
                    return;
                }
            }
        })
    }

    fn subscribe_all(&self) -> BoxStream<'static, RecordedEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| futures::future::ready(item.ok()))
            .boxed()
    }

    async fn head(&self, stream_id: &StreamId) -> Result<StreamPosition, EventStoreError> {
        let conn = self.conn.clone();
        let id = stream_id.clone();
        let length =
            tokio::task::spawn_blocking(move || stream_length(&conn.lock(), &id))
                .await
                .map_err(|e| EventStoreError::backend(format!("head task failed: {e}")))??;
        Ok(StreamPosition::new(stream_id.clone(), length))
    }
}
