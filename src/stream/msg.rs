//! # Streamable Messages
//!
//! Entity snapshots, change events, and pre-serialized outbound frames.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{StreamError, StreamResult};
use super::keyset;

/// A streamable entity snapshot.
///
/// Snapshots are immutable values built from a database row; a newer row
/// always carries a larger `seq_num` than an older row of the same type.
pub trait Msg: Serialize + Send + Sync + 'static {
    /// JSON key of an upsert frame, e.g. `"trial"`
    const UPSERT_KEY: &'static str;
    /// JSON key of a deletion frame, e.g. `"trials_deleted"`
    const DELETE_KEY: &'static str;

    /// Primary key
    fn id(&self) -> i64;

    /// Per-type sequence number
    fn seq_num(&self) -> i64;
}

/// A single row change.
///
/// Exactly one shape holds: insert (before = None), update (both set), or
/// delete (after = None).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    pub before: Option<T>,
    pub after: Option<T>,
}

impl<T> Event<T> {
    /// Row created
    pub fn insert(after: T) -> Self {
        Self {
            before: None,
            after: Some(after),
        }
    }

    /// Row changed
    pub fn update(before: T, after: T) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    /// Row removed
    pub fn delete(before: T) -> Self {
        Self {
            before: Some(before),
            after: None,
        }
    }

    /// An event with neither image carries no change
    pub fn validate(&self) -> StreamResult<()> {
        if self.before.is_none() && self.after.is_none() {
            return Err(StreamError::InvalidMessage(
                "event has neither a before nor an after image".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a prepared frame represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Full snapshot of a row that exists and is visible
    Upsert { id: i64, seq: i64 },
    /// Range-encoded keys that are gone or no longer visible
    Delete,
    /// Sync bracket
    Sync { complete: bool },
}

/// An outbound frame serialized once and shared by every recipient.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    kind: MessageKind,
    text: Arc<str>,
}

impl PreparedMessage {
    /// `{"<upsert key>": {row}}`
    pub fn upsert<T: Msg>(msg: &T) -> StreamResult<Self> {
        let row = serde_json::to_value(msg)
            .map_err(|e| StreamError::Internal(format!("serializing {}: {}", T::UPSERT_KEY, e)))?;
        let mut frame = Map::with_capacity(1);
        frame.insert(T::UPSERT_KEY.to_string(), row);
        Ok(Self {
            kind: MessageKind::Upsert {
                id: msg.id(),
                seq: msg.seq_num(),
            },
            text: Value::Object(frame).to_string().into(),
        })
    }

    /// Deletion frame for a single row
    pub fn delete<T: Msg>(msg: &T) -> Self {
        Self::deleted(T::DELETE_KEY, &keyset::encode(&[msg.id()]))
    }

    /// `{"<delete key>": "<range string>"}`
    pub fn deleted(delete_key: &str, range: &str) -> Self {
        let mut frame = Map::with_capacity(1);
        frame.insert(delete_key.to_string(), Value::String(range.to_string()));
        Self {
            kind: MessageKind::Delete,
            text: Value::Object(frame).to_string().into(),
        }
    }

    /// `{"sync_id": "...", "complete": bool}`
    pub fn sync(sync_id: &str, complete: bool) -> Self {
        let frame = serde_json::json!({
            "sync_id": sync_id,
            "complete": complete,
        });
        Self {
            kind: MessageKind::Sync { complete },
            text: frame.to_string().into(),
        }
    }

    /// Frame kind
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Wire text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parse the wire text back into JSON
    pub fn to_json(&self) -> Value {
        serde_json::from_str(&self.text).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: i64,
        seq: i64,
    }

    impl Msg for Widget {
        const UPSERT_KEY: &'static str = "widget";
        const DELETE_KEY: &'static str = "widgets_deleted";

        fn id(&self) -> i64 {
            self.id
        }

        fn seq_num(&self) -> i64 {
            self.seq
        }
    }

    #[test]
    fn test_event_shapes() {
        let w = Widget { id: 1, seq: 1 };
        assert!(Event::insert(w.clone()).validate().is_ok());
        assert!(Event::delete(w.clone()).validate().is_ok());
        assert!(Event::update(w.clone(), w).validate().is_ok());
        assert!(Event::<Widget> { before: None, after: None }.validate().is_err());
    }

    #[test]
    fn test_event_parse() {
        let event: Event<Widget> =
            serde_json::from_str(r#"{"before": null, "after": {"id": 3, "seq": 9}}"#).unwrap();
        assert_eq!(event.after, Some(Widget { id: 3, seq: 9 }));
        assert!(event.before.is_none());

        let event: Event<Widget> = serde_json::from_str(r#"{"before": {"id": 3, "seq": 9}}"#).unwrap();
        assert!(event.after.is_none());
    }

    #[test]
    fn test_prepared_frames() {
        let w = Widget { id: 7, seq: 42 };

        let upsert = PreparedMessage::upsert(&w).unwrap();
        assert_eq!(upsert.kind(), MessageKind::Upsert { id: 7, seq: 42 });
        assert_eq!(upsert.to_json()["widget"]["seq"], 42);

        let delete = PreparedMessage::delete(&w);
        assert_eq!(delete.kind(), MessageKind::Delete);
        assert_eq!(delete.to_json()["widgets_deleted"], "7");

        let sync = PreparedMessage::sync("abc", true);
        assert_eq!(sync.to_json(), serde_json::json!({"sync_id": "abc", "complete": true}));
    }
}
