use std::path::{Path, PathBuf};

use chrono::Local;

use crate::shell::{CommandRunner, ShellError};

/// Timestamp layout shared by the sink and the read-side queries. Local time,
/// second precision; lexicographic order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The two screen-state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ScreenOn,
    ScreenOff,
}

impl EventKind {
    /// Tag stored in the `event_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ScreenOn => "SCREEN_ON",
            EventKind::ScreenOff => "SCREEN_OFF",
        }
    }
}

/// A single observed transition. Created only when the derived boolean state
/// changes, consumed immediately by the sink, never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: String,
}

impl Event {
    /// Stamp a transition with the current local time.
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// Destination for observed transitions. Best-effort, at-most-once: the
/// monitor loop logs a failed persist and keeps running.
pub trait EventSink {
    fn persist(&mut self, event: &Event) -> Result<(), ShellError>;
}

/// Persists events by handing a single-row insert to the `sqlite3` command
/// line tool through the elevated command port.
pub struct SqliteCliSink<'a> {
    db_path: PathBuf,
    runner: &'a dyn CommandRunner,
}

impl<'a> SqliteCliSink<'a> {
    pub fn new(db_path: impl Into<PathBuf>, runner: &'a dyn CommandRunner) -> Self {
        Self {
            db_path: db_path.into(),
            runner,
        }
    }

    // Both values are generated internally (a fixed tag and a formatted
    // timestamp), so no quoting beyond the literal single quotes is needed.
    fn insert_command(&self, event: &Event) -> String {
        format!(
            "sqlite3 {} \"INSERT INTO screen_events (event_type, timestamp) VALUES ('{}', '{}');\"",
            self.db_path.display(),
            event.kind.as_str(),
            event.timestamp,
        )
    }
}

impl EventSink for SqliteCliSink<'_> {
    fn persist(&mut self, event: &Event) -> Result<(), ShellError> {
        let command = self.insert_command(event);
        self.runner.run(&command)?;
        tracing::debug!(
            kind = event.kind.as_str(),
            timestamp = %event.timestamp,
            "event persisted"
        );
        Ok(())
    }
}

/// Read the watched file's raw numeric value on behalf of the control
/// surface and the monitor loop.
///
/// Any failure — missing file, unreadable content, non-numeric content —
/// maps to `-1`, which derives screen-off.
pub fn read_raw_value(path: &Path) -> i64 {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents.trim().parse().unwrap_or(-1),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "failed to read watched file");
            -1
        }
    }
}

/// Boolean derivation of the raw value.
pub fn screen_on(value: i64) -> bool {
    value > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::RecordingRunner;
    use chrono::NaiveDateTime;

    #[test]
    fn test_event_kind_tags() {
        assert_eq!(EventKind::ScreenOn.as_str(), "SCREEN_ON");
        assert_eq!(EventKind::ScreenOff.as_str(), "SCREEN_OFF");
    }

    #[test]
    fn test_event_now_uses_second_precision_local_format() {
        let event = Event::now(EventKind::ScreenOn);
        assert!(
            NaiveDateTime::parse_from_str(&event.timestamp, TIMESTAMP_FORMAT).is_ok(),
            "unexpected timestamp shape: {}",
            event.timestamp
        );
    }

    #[test]
    fn test_sink_formats_single_row_insert() {
        let runner = RecordingRunner::succeeding();
        let mut sink = SqliteCliSink::new("/data/screen_logger.db", &runner);
        let event = Event {
            kind: EventKind::ScreenOn,
            timestamp: "2026-08-07 10:15:00".to_string(),
        };

        sink.persist(&event).unwrap();
        assert_eq!(
            runner.recorded(),
            vec![
                "sqlite3 /data/screen_logger.db \"INSERT INTO screen_events \
                 (event_type, timestamp) VALUES ('SCREEN_ON', '2026-08-07 10:15:00');\""
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_sink_surfaces_runner_failure() {
        let runner = RecordingRunner::failing();
        let mut sink = SqliteCliSink::new("/data/screen_logger.db", &runner);

        let err = sink.persist(&Event::now(EventKind::ScreenOff)).unwrap_err();
        assert!(err.to_string().contains("scripted failure"));
        assert_eq!(runner.recorded().len(), 1);
    }

    #[test]
    fn test_read_raw_value_parses_plain_integer() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("brightness");

        std::fs::write(&path, "120\n").unwrap();
        assert_eq!(read_raw_value(&path), 120);

        std::fs::write(&path, "0").unwrap();
        assert_eq!(read_raw_value(&path), 0);
    }

    #[test]
    fn test_read_raw_value_failure_maps_to_negative_one() {
        let tmp = tempfile::tempdir().unwrap();

        assert_eq!(read_raw_value(&tmp.path().join("absent")), -1);

        let path = tmp.path().join("brightness");
        std::fs::write(&path, "not-a-number\n").unwrap();
        assert_eq!(read_raw_value(&path), -1);
    }

    #[test]
    fn test_screen_on_boundary() {
        assert!(!screen_on(-1));
        assert!(!screen_on(0));
        assert!(screen_on(1));
        assert!(screen_on(255));
    }
}
