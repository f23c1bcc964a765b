//! Event envelope codec.
//!
//! Converts between [`Event`] values and the JSON envelope text format:
//!
//! ```text
//! {
//!   "events": [
//!     { "stream": "<stream>", "type": "<type>", "data": { ... } },
//!     { "type": "<type>", "data": { ... } }
//!   ]
//! }
//! ```
//!
//! Decoding also accepts a bare array of envelopes. `stream` is optional and
//! falls back to the stream supplied by the caller.

use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ClientError, Result};
use crate::event::Event;

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<&'a str>,
    #[serde(rename = "type")]
    event_type: &'a str,
    data: &'a Value,
}

impl<'a> From<&'a Event> for Envelope<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            stream: event.stream_id.as_deref(),
            event_type: &event.event_type,
            data: &event.payload,
        }
    }
}

#[derive(Serialize)]
struct Batch<'a> {
    events: Vec<Envelope<'a>>,
}

/// Encode events as `{"events":[...]}`, preserving order.
pub fn encode(events: &[Event]) -> Result<String> {
    let batch = Batch {
        events: events.iter().map(Envelope::from).collect(),
    };
    Ok(serde_json::to_string(&batch)?)
}

/// Encode a single event as an envelope object.
pub fn encode_event(event: &Event) -> Result<Value> {
    Ok(serde_json::to_value(Envelope::from(event))?)
}

/// Decode envelope text into events.
///
/// Each decoded event gets a fresh random id. Events without a `stream`
/// field are assigned `default_stream` when one is given.
pub fn decode(text: &str, default_stream: Option<&str>) -> Result<Vec<Event>> {
    let root: Value = serde_json::from_str(text)
        .map_err(|e| ClientError::MalformedInput(format!("invalid JSON: {}", e)))?;
    decode_value(&root, default_stream)
}

/// Decode an already-parsed JSON document into events.
pub fn decode_value(root: &Value, default_stream: Option<&str>) -> Result<Vec<Event>> {
    let envelopes = match root {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("events") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ClientError::MalformedInput(
                    "'events' must be an array".to_string(),
                ))
            }
            None => {
                return Err(ClientError::MalformedInput(
                    "object has no 'events' array".to_string(),
                ))
            }
        },
        _ => {
            return Err(ClientError::MalformedInput(
                "top-level value must be an array or an object with 'events'".to_string(),
            ))
        }
    };

    envelopes
        .iter()
        .enumerate()
        .map(|(index, envelope)| decode_envelope(index, envelope, default_stream))
        .collect()
}

fn decode_envelope(index: usize, envelope: &Value, default_stream: Option<&str>) -> Result<Event> {
    let obj = envelope
        .as_object()
        .ok_or_else(|| malformed(index, "envelope is not an object"))?;

    let event_type = match obj.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(_) => return Err(malformed(index, "'type' is not a string")),
        None => return Err(malformed(index, "missing 'type'")),
    };

    let data = match obj.get("data") {
        Some(Value::Object(data)) => Value::Object(data.clone()),
        Some(_) => return Err(malformed(index, "'data' is not an object")),
        None => return Err(malformed(index, "missing 'data'")),
    };

    let stream = stream_field(index, obj)?.or(default_stream);

    let event = Event::new(event_type, data);
    Ok(match stream {
        Some(stream) => event.with_stream(stream),
        None => event,
    })
}

fn stream_field<'a>(index: usize, obj: &'a Map<String, Value>) -> Result<Option<&'a str>> {
    match obj.get("stream") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(malformed(index, "'stream' is not a string")),
    }
}

fn malformed(index: usize, reason: &str) -> ClientError {
    ClientError::MalformedInput(format!("event {}: {}", index, reason))
}

/// Read and decode an envelope file.
pub fn load_file(path: impl AsRef<Path>, default_stream: Option<&str>) -> Result<Vec<Event>> {
    let text = std::fs::read_to_string(path)?;
    decode(&text, default_stream)
}
