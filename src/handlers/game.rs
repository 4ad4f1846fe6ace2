//! Game session handler.
//!
//! ## Message Flow
//!
//! ```text
//! authenticate_client_request  -> authenticate_client_response (same payload)
//! game_start_request           -> game_start_response          (same payload)
//! client_state_information {…} -> server_to_client_response    {"keys": [...], "values": [...]}
//! client_state_information null -> game_completed null
//! ```
//!
//! A `null` client state ends the game for that connection. From then on
//! every message, whatever its kind, is answered with `game_completed`.
//! Before that, kinds a client is not expected to send are rejected as
//! unsupported.

use serde_json::Value;
use std::net::SocketAddr;

use crate::envelope::{MessageEnvelope, MessageKind, Payload};
use crate::handler::{HandlerError, HandlerResult, MessageHandler};

#[derive(Debug, Default, Clone, Copy)]
pub struct GameHandler;

/// Per-connection game state.
#[derive(Debug, Default)]
pub struct GameSession {
    completed: bool,
}

impl GameSession {
    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl MessageHandler for GameHandler {
    type Session = GameSession;

    fn open_session(&self, _peer: SocketAddr) -> GameSession {
        GameSession::default()
    }

    fn process_message(
        &self,
        session: &mut GameSession,
        envelope: &MessageEnvelope,
    ) -> HandlerResult {
        if session.completed {
            return Ok(vec![MessageEnvelope::empty(MessageKind::GameCompleted)]);
        }

        let response = match envelope.kind() {
            MessageKind::AuthenticateClientRequest => MessageEnvelope::new(
                MessageKind::AuthenticateClientResponse,
                envelope.payload().cloned(),
            ),
            MessageKind::GameStartRequest => MessageEnvelope::new(
                MessageKind::GameStartResponse,
                envelope.payload().cloned(),
            ),
            MessageKind::ClientStateInformation => match envelope.payload() {
                Some(state) => MessageEnvelope::new(
                    MessageKind::ServerToClientResponse,
                    Some(state_summary(state)),
                ),
                None => {
                    session.completed = true;
                    MessageEnvelope::empty(MessageKind::GameCompleted)
                }
            },
            other => return Err(HandlerError::Unsupported(other)),
        };

        Ok(vec![response])
    }
}

/// Split a client state object into parallel key and value lists.
fn state_summary(state: &Payload) -> Payload {
    let keys = state.keys().cloned().map(Value::String).collect();
    let values = state.values().cloned().collect();

    let mut summary = Payload::with_capacity(2);
    summary.insert("keys".to_string(), Value::Array(keys));
    summary.insert("values".to_string(), Value::Array(values));
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Option<Payload> {
        match value {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => panic!("not an object: {other}"),
        }
    }

    fn handle(session: &mut GameSession, kind: MessageKind, body: Value) -> HandlerResult {
        GameHandler.process_message(session, &MessageEnvelope::new(kind, payload(body)))
    }

    #[test]
    fn test_authenticate_echoes_payload() {
        let mut session = GameSession::default();
        let responses = handle(
            &mut session,
            MessageKind::AuthenticateClientRequest,
            json!({"test": true}),
        )
        .unwrap();

        assert_eq!(
            responses,
            vec![MessageEnvelope::new(
                MessageKind::AuthenticateClientResponse,
                payload(json!({"test": true}))
            )]
        );
    }

    #[test]
    fn test_game_start_echoes_payload() {
        let mut session = GameSession::default();
        let responses =
            handle(&mut session, MessageKind::GameStartRequest, json!({"test": true})).unwrap();

        assert_eq!(
            responses,
            vec![MessageEnvelope::new(
                MessageKind::GameStartResponse,
                payload(json!({"test": true}))
            )]
        );
    }

    #[test]
    fn test_client_state_summary() {
        let mut session = GameSession::default();
        let responses = handle(
            &mut session,
            MessageKind::ClientStateInformation,
            json!({"x": 3, "alive": true, "name": "elf"}),
        )
        .unwrap();

        assert_eq!(
            responses,
            vec![MessageEnvelope::new(
                MessageKind::ServerToClientResponse,
                payload(json!({
                    "keys": ["x", "alive", "name"],
                    "values": [3, true, "elf"]
                }))
            )]
        );
        assert!(!session.is_completed());
    }

    #[test]
    fn test_null_state_completes_game() {
        let mut session = GameSession::default();
        let responses =
            handle(&mut session, MessageKind::ClientStateInformation, Value::Null).unwrap();

        assert_eq!(
            responses,
            vec![MessageEnvelope::empty(MessageKind::GameCompleted)]
        );
        assert!(session.is_completed());

        // Every later message gets the completion answer, even kinds that
        // would otherwise be rejected.
        for kind in MessageKind::ALL {
            let responses = handle(&mut session, kind, json!({"test": true})).unwrap();
            assert_eq!(
                responses,
                vec![MessageEnvelope::empty(MessageKind::GameCompleted)]
            );
        }
    }

    #[test]
    fn test_unsupported_kinds() {
        let mut session = GameSession::default();
        for kind in [
            MessageKind::GameStartResponse,
            MessageKind::AuthenticateClientResponse,
            MessageKind::ServerToClientResponse,
            MessageKind::GameCompleted,
        ] {
            assert_eq!(
                handle(&mut session, kind, Value::Null),
                Err(HandlerError::Unsupported(kind))
            );
        }
        assert!(!session.is_completed());
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut finished = GameSession::default();
        let mut fresh = GameSession::default();

        handle(&mut finished, MessageKind::ClientStateInformation, Value::Null).unwrap();

        let responses =
            handle(&mut fresh, MessageKind::GameStartRequest, json!({"test": true})).unwrap();
        assert_eq!(responses[0].kind(), MessageKind::GameStartResponse);
    }
}
