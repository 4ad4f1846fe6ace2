//! Message envelope: the unit of protocol communication.
//!
//! Every message on the wire is a single JSON object with exactly two
//! fields:
//!
//! ```text
//! {"kind": "<kind string>", "payload": <object or null>}
//! ```
//!
//! The payload is opaque to the envelope. A `null` (or missing) payload is
//! kept distinct from an empty object.
//!
//! Payloads may nest objects and arrays at most [`MAX_PAYLOAD_DEPTH`] levels
//! deep, counting the payload object itself. `serialize` and `parse` both
//! reject anything deeper, so every envelope that serializes also parses
//! back unchanged. The limit sits below `serde_json`'s own parser recursion
//! limit.

use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Structured payload carried by an envelope.
pub type Payload = Map<String, Value>;

/// Deepest allowed nesting of objects and arrays in a payload.
pub const MAX_PAYLOAD_DEPTH: usize = 100;

/// Recognized message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    GameStartRequest,
    GameStartResponse,
    AuthenticateClientRequest,
    AuthenticateClientResponse,
    ClientStateInformation,
    ServerToClientResponse,
    GameCompleted,
}

impl MessageKind {
    /// Every recognized kind, in declaration order.
    pub const ALL: [MessageKind; 7] = [
        MessageKind::GameStartRequest,
        MessageKind::GameStartResponse,
        MessageKind::AuthenticateClientRequest,
        MessageKind::AuthenticateClientResponse,
        MessageKind::ClientStateInformation,
        MessageKind::ServerToClientResponse,
        MessageKind::GameCompleted,
    ];

    /// Canonical wire identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::GameStartRequest => "game_start_request",
            MessageKind::GameStartResponse => "game_start_response",
            MessageKind::AuthenticateClientRequest => "authenticate_client_request",
            MessageKind::AuthenticateClientResponse => "authenticate_client_response",
            MessageKind::ClientStateInformation => "client_state_information",
            MessageKind::ServerToClientResponse => "server_to_client_response",
            MessageKind::GameCompleted => "game_completed",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::MalformedEnvelope(format!("unknown message kind '{s}'")))
    }
}

/// Immutable protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    kind: MessageKind,
    payload: Option<Payload>,
}

/// Shape of an envelope as it appears on the wire, before the kind is
/// resolved.
#[derive(Deserialize)]
struct WireEnvelope {
    kind: Option<String>,
    #[serde(default)]
    payload: Option<Payload>,
}

impl MessageEnvelope {
    pub fn new(kind: MessageKind, payload: Option<Payload>) -> Self {
        Self { kind, payload }
    }

    /// Envelope with a `null` payload.
    pub fn empty(kind: MessageKind) -> Self {
        Self::new(kind, None)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Encode to compact JSON text.
    ///
    /// Fails with [`Error::MalformedEnvelope`] when the payload nests deeper
    /// than [`MAX_PAYLOAD_DEPTH`], since such text would not parse back.
    pub fn serialize(&self) -> Result<String> {
        if let Some(payload) = &self.payload {
            check_depth(payload)?;
        }

        let mut wire = Map::with_capacity(2);
        wire.insert("kind".to_string(), Value::from(self.kind.as_str()));
        wire.insert(
            "payload".to_string(),
            self.payload.clone().map_or(Value::Null, Value::Object),
        );
        Ok(Value::Object(wire).to_string())
    }

    /// Decode from JSON text.
    ///
    /// Fails with [`Error::MalformedEnvelope`] when the text is not a JSON
    /// object, the kind is missing or unknown, or the payload is neither an
    /// object nor `null`, or nests deeper than [`MAX_PAYLOAD_DEPTH`].
    /// Unrecognized extra fields are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
        if !value.is_object() {
            return Err(Error::MalformedEnvelope(
                "envelope must be a JSON object".to_string(),
            ));
        }
        let wire =
            WireEnvelope::deserialize(value).map_err(|e| Error::MalformedEnvelope(e.to_string()))?;

        let kind = wire
            .kind
            .ok_or_else(|| Error::MalformedEnvelope("missing message kind".to_string()))?
            .parse()?;

        if let Some(payload) = &wire.payload {
            check_depth(payload)?;
        }

        Ok(Self {
            kind,
            payload: wire.payload,
        })
    }

    /// Decode from a raw frame; non-UTF-8 input is malformed.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        let text =
            std::str::from_utf8(bytes).map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
        Self::parse(text)
    }
}

fn check_depth(payload: &Payload) -> Result<()> {
    if payload_depth_exceeds(payload, MAX_PAYLOAD_DEPTH) {
        return Err(Error::MalformedEnvelope(format!(
            "payload nested deeper than {MAX_PAYLOAD_DEPTH} levels"
        )));
    }
    Ok(())
}

/// True if `payload` nests objects/arrays more than `limit` levels deep.
///
/// Iterative, and stops at the first path past the limit, so arbitrarily
/// deep in-memory values are safe to check.
fn payload_depth_exceeds(payload: &Payload, limit: usize) -> bool {
    if limit == 0 {
        return true;
    }

    let mut pending: Vec<(&Value, usize)> = payload.values().map(|v| (v, 1)).collect();
    while let Some((value, parent_depth)) = pending.pop() {
        let depth = parent_depth + 1;
        match value {
            Value::Object(_) | Value::Array(_) if depth > limit => return true,
            Value::Object(map) => pending.extend(map.values().map(|child| (child, depth))),
            Value::Array(items) => pending.extend(items.iter().map(|child| (child, depth))),
            _ => {}
        }
    }

    false
}
