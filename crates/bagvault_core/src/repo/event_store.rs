//! Append-only event store.
//!
//! # Responsibility
//! - Append domain events with a global sequence and a gap-free
//!   per-aggregate sequence.
//! - Serve an aggregate's ordered history and filtered cursors.
//!
//! # Invariants
//! - Rows are never updated or deleted (enforced by triggers).
//! - Per aggregate, `aggregate_seq` increases by one and `created_at` never
//!   decreases, even if the wall clock steps back.
//! - Events appended in one transaction keep their call order.

use super::{parse_uuid, RepoError, RepoResult};
use crate::model::event::{Event, EventType, NewEvent};
use crate::model::now_epoch_ms;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use uuid::Uuid;

const EVENT_SELECT_SQL: &str = "SELECT
    seq,
    uuid,
    event_type,
    aggregate_uuid,
    aggregate_seq,
    payload,
    created_at
FROM events";

/// Cursor query over the global log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub event_type: Option<EventType>,
    pub aggregate_uuid: Option<Uuid>,
    /// Only events with `seq > after_seq`.
    pub after_seq: Option<i64>,
    pub limit: Option<u32>,
}

pub trait EventStore {
    fn append(&self, event: &NewEvent) -> RepoResult<Event>;
    /// Appends with an explicit clock reading.
    fn append_at(&self, event: &NewEvent, now_ms: i64) -> RepoResult<Event>;
    /// Appends all events or none.
    fn append_batch(&self, events: &[NewEvent]) -> RepoResult<Vec<Event>>;
    /// Full history of one aggregate in `aggregate_seq` order.
    fn history(&self, aggregate_uuid: Uuid) -> RepoResult<Vec<Event>>;
    /// Events in global order.
    fn list(&self, query: &EventQuery) -> RepoResult<Vec<Event>>;
    /// Highest global sequence, 0 for an empty log.
    fn latest_seq(&self) -> RepoResult<i64>;
}

pub struct SqliteEventStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteEventStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn get_by_seq(&self, seq: i64) -> RepoResult<Event> {
        let mut stmt = self
            .conn
            .prepare(&format!("{EVENT_SELECT_SQL} WHERE seq = ?1;"))?;
        let mut rows = stmt.query([seq])?;
        match rows.next()? {
            Some(row) => parse_event_row(row),
            None => Err(RepoError::not_found("event", seq)),
        }
    }
}

impl EventStore for SqliteEventStore<'_> {
    fn append(&self, event: &NewEvent) -> RepoResult<Event> {
        self.append_at(event, now_epoch_ms())
    }

    fn append_at(&self, event: &NewEvent, now_ms: i64) -> RepoResult<Event> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|err| RepoError::InvalidData(format!("cannot encode event payload: {err}")))?;
        self.conn.execute(
            "INSERT INTO events (uuid, event_type, aggregate_uuid, aggregate_seq, payload, created_at)
             SELECT
                ?1,
                ?2,
                ?3,
                COALESCE(MAX(aggregate_seq), 0) + 1,
                ?4,
                MAX(?5, COALESCE(MAX(created_at), ?5))
             FROM events
             WHERE aggregate_uuid = ?3;",
            params![
                Uuid::new_v4().to_string(),
                event.event_type.as_str(),
                event.aggregate_uuid.to_string(),
                payload,
                now_ms,
            ],
        )?;
        self.get_by_seq(self.conn.last_insert_rowid())
    }

    fn append_batch(&self, events: &[NewEvent]) -> RepoResult<Vec<Event>> {
        self.conn.execute_batch("SAVEPOINT event_batch;")?;
        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            match self.append(event) {
                Ok(stored) => appended.push(stored),
                Err(err) => {
                    self.conn
                        .execute_batch("ROLLBACK TO event_batch; RELEASE event_batch;")?;
                    return Err(err);
                }
            }
        }
        self.conn.execute_batch("RELEASE event_batch;")?;
        Ok(appended)
    }

    fn history(&self, aggregate_uuid: Uuid) -> RepoResult<Vec<Event>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EVENT_SELECT_SQL} WHERE aggregate_uuid = ?1 ORDER BY aggregate_seq ASC;"
        ))?;
        let mut rows = stmt.query([aggregate_uuid.to_string()])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(parse_event_row(row)?);
        }
        Ok(events)
    }

    fn list(&self, query: &EventQuery) -> RepoResult<Vec<Event>> {
        let mut sql = format!("{EVENT_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(event_type) = query.event_type {
            sql.push_str(" AND event_type = ?");
            bind_values.push(Value::Text(event_type.as_str().to_string()));
        }
        if let Some(aggregate_uuid) = query.aggregate_uuid {
            sql.push_str(" AND aggregate_uuid = ?");
            bind_values.push(Value::Text(aggregate_uuid.to_string()));
        }
        if let Some(after_seq) = query.after_seq {
            sql.push_str(" AND seq > ?");
            bind_values.push(Value::Integer(after_seq));
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(parse_event_row(row)?);
        }
        Ok(events)
    }

    fn latest_seq(&self) -> RepoResult<i64> {
        let seq = self
            .conn
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM events;", [], |row| {
                row.get::<_, i64>(0)
            })?;
        Ok(seq)
    }
}

fn parse_event_row(row: &Row<'_>) -> RepoResult<Event> {
    let uuid_text: String = row.get("uuid")?;
    let type_text: String = row.get("event_type")?;
    let aggregate_text: String = row.get("aggregate_uuid")?;
    let payload_text: String = row.get("payload")?;

    let event_type = EventType::parse(&type_text).ok_or_else(|| {
        RepoError::InvalidData(format!("unknown event type `{type_text}` in events.event_type"))
    })?;
    let payload = serde_json::from_str(&payload_text)
        .map_err(|err| RepoError::InvalidData(format!("invalid JSON in events.payload: {err}")))?;

    Ok(Event {
        seq: row.get("seq")?,
        uuid: parse_uuid(&uuid_text, "events.uuid")?,
        event_type,
        aggregate_uuid: parse_uuid(&aggregate_text, "events.aggregate_uuid")?,
        aggregate_seq: row.get("aggregate_seq")?,
        payload,
        created_at: row.get("created_at")?,
    })
}
