use rusqlite::{Connection, Result, Row};
use std::path::Path;

use crate::events::EventKind;

/// Opens (or creates) the screen-event database at the given path.
///
/// The schema matches what the worker's `sqlite3` inserts expect, so opening
/// the database once up front is enough to make the write path work. Returns
/// an open connection ready for queries.
pub fn open_or_create(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS screen_events (
            _id        INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            timestamp  TEXT NOT NULL
        );",
    )?;

    Ok(conn)
}

/// A row from the screen_events table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenEvent {
    pub id: i64,
    pub event_type: String,
    pub timestamp: String,
}

fn map_event(row: &Row<'_>) -> Result<ScreenEvent> {
    Ok(ScreenEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        timestamp: row.get(2)?,
    })
}

/// Events at or after `cutoff` (same textual timestamp format the sink
/// writes), newest first.
pub fn events_since(conn: &Connection, cutoff: &str) -> Result<Vec<ScreenEvent>> {
    let mut stmt = conn.prepare(
        "SELECT _id, event_type, timestamp FROM screen_events
         WHERE timestamp >= ?1 ORDER BY timestamp DESC",
    )?;
    let rows = stmt.query_map([cutoff], map_event)?;
    rows.collect()
}

/// The most recent `limit` events, newest first.
pub fn recent_events(conn: &Connection, limit: u32) -> Result<Vec<ScreenEvent>> {
    let mut stmt = conn.prepare(
        "SELECT _id, event_type, timestamp FROM screen_events
         ORDER BY timestamp DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], map_event)?;
    rows.collect()
}

/// Timestamp of the most recent event of the given kind, if any.
pub fn last_event_time(conn: &Connection, kind: EventKind) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT timestamp FROM screen_events
         WHERE event_type = ?1 ORDER BY timestamp DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map([kind.as_str()], |row| row.get(0))?;
    rows.next().transpose()
}
