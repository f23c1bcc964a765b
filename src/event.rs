//! Event data model: events, positions and concurrency tokens.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type used by link events.
pub const LINK_EVENT_TYPE: &str = "$>";

/// An immutable event value.
///
/// Built client-side with [`Event::new`] (no stream, revision or position yet)
/// and returned by reads with every field populated by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stream the event belongs to. Absent before append.
    pub stream_id: Option<String>,
    /// Client-generated unique id.
    pub event_id: Uuid,
    /// Type tag.
    pub event_type: String,
    /// JSON payload.
    pub payload: Value,
    /// Per-stream sequence number, assigned by the store.
    pub revision: Option<u64>,
    /// Global-log position, assigned by the store.
    pub position: Option<Position>,
    /// Commit timestamp, assigned by the store.
    pub created: Option<DateTime<Utc>>,
}

impl Event {
    /// Create a new event with a fresh random id.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            stream_id: None,
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            revision: None,
            position: None,
            created: None,
        }
    }

    /// Create a link event pointing at `revision` of `stream`.
    pub fn link_to(stream: &str, revision: u64) -> Self {
        Self::new(LINK_EVENT_TYPE, Value::String(format!("{}@{}", revision, stream)))
    }

    /// Returns a copy targeted at `stream`.
    pub fn with_stream(self, stream: impl Into<String>) -> Self {
        Self {
            stream_id: Some(stream.into()),
            ..self
        }
    }

    /// Returns a copy with the given id.
    pub fn with_id(self, event_id: Uuid) -> Self {
        Self { event_id, ..self }
    }

    /// Returns a copy stamped with store-assigned fields.
    pub fn recorded(self, revision: u64, position: Position, created: DateTime<Utc>) -> Self {
        Self {
            revision: Some(revision),
            position: Some(position),
            created: Some(created),
            ..self
        }
    }

    /// True if this is a link event.
    pub fn is_link(&self) -> bool {
        self.event_type == LINK_EVENT_TYPE
    }

    /// Parse a link event's target as `(stream, revision)`.
    pub fn link_target(&self) -> Option<(&str, u64)> {
        if !self.is_link() {
            return None;
        }
        let text = self.payload.as_str()?;
        let (revision, stream) = text.split_once('@')?;
        let revision = revision.parse().ok()?;
        Some((stream, revision))
    }
}

/// Opaque position in the global log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub commit: u64,
    pub prepare: u64,
}

impl Position {
    /// Before the first event of the log.
    pub const START: Position = Position {
        commit: 0,
        prepare: 0,
    };

    /// After the last event of the log.
    pub const END: Position = Position {
        commit: u64::MAX,
        prepare: u64::MAX,
    };

    pub fn new(commit: u64, prepare: u64) -> Self {
        Self { commit, prepare }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C:{}/P:{}", self.commit, self.prepare)
    }
}

/// Origin of a per-stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPosition {
    /// First event of the stream.
    Start,
    /// Current last event of the stream.
    End,
    /// A specific revision.
    At(u64),
}

impl From<u64> for StreamPosition {
    fn from(revision: u64) -> Self {
        StreamPosition::At(revision)
    }
}

/// Direction of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// Optimistic-concurrency precondition for writes and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedVersion {
    /// No check.
    #[default]
    Any,
    /// The stream must not exist.
    NoStream,
    /// The stream must exist, at any revision.
    StreamExists,
    /// The stream's last revision must equal this value.
    Exact(u64),
}

impl ExpectedVersion {
    /// Check the expectation against a stream's current last revision.
    pub fn matches(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::NoStream, None) => true,
            (ExpectedVersion::StreamExists, Some(_)) => true,
            (ExpectedVersion::Exact(expected), Some(actual)) => *expected == actual,
            _ => false,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::NoStream => write!(f, "no_stream"),
            ExpectedVersion::StreamExists => write!(f, "stream_exists"),
            ExpectedVersion::Exact(revision) => write!(f, "exact({})", revision),
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Revision of the last event written.
    pub next_expected_version: u64,
    /// Global position of the last event written.
    pub log_position: Position,
}

/// Result of a successful delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub log_position: Position,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_has_no_store_fields() {
        let event = Event::new("Created", json!({"v": 1}));
        assert!(event.stream_id.is_none());
        assert!(event.revision.is_none());
        assert!(event.position.is_none());
        assert!(event.created.is_none());
    }

    #[test]
    fn test_new_events_get_distinct_ids() {
        let a = Event::new("A", json!({}));
        let b = Event::new("A", json!({}));
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_link_target_parses() {
        let link = Event::link_to("orders-1", 4);
        assert!(link.is_link());
        assert_eq!(link.link_target(), Some(("orders-1", 4)));
    }

    #[test]
    fn test_link_target_rejects_plain_events() {
        let event = Event::new("Created", json!("4@orders"));
        assert_eq!(event.link_target(), None);
    }

    #[test]
    fn test_position_ordering() {
        assert!(Position::START < Position::new(1, 1));
        assert!(Position::new(5, 5) < Position::END);
    }

    #[test]
    fn test_expected_version_matches() {
        assert!(ExpectedVersion::Any.matches(None));
        assert!(ExpectedVersion::Any.matches(Some(3)));
        assert!(ExpectedVersion::NoStream.matches(None));
        assert!(!ExpectedVersion::NoStream.matches(Some(0)));
        assert!(ExpectedVersion::StreamExists.matches(Some(0)));
        assert!(!ExpectedVersion::StreamExists.matches(None));
        assert!(ExpectedVersion::Exact(2).matches(Some(2)));
        assert!(!ExpectedVersion::Exact(2).matches(Some(3)));
        assert!(!ExpectedVersion::Exact(0).matches(None));
    }
}
