//! Real-time draw relay: tracks connected sketch clients and acknowledges
//! every stroke message they send.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use axum::extract::ws::{Message, WebSocket};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawAck {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: Value,
    pub status: &'static str,
}

#[derive(Default)]
pub struct DrawRelay {
    members: Mutex<HashSet<Uuid>>,
}

impl DrawRelay {
    pub fn join(&self) -> Uuid {
        let id = Uuid::new_v4();
        let mut members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
        members.insert(id);
        info!("client connected, total: {}", members.len());
        id
    }

    pub fn leave(&self, id: Uuid) {
        let mut members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
        if members.remove(&id) {
            info!("client disconnected, total: {}", members.len());
        }
    }

    pub fn connections(&self) -> usize {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Builds the acknowledgement for one raw message, or `None` when it is not a JSON object.
    pub fn acknowledge(raw: &str) -> Option<DrawAck> {
        let Ok(Value::Object(message)) = serde_json::from_str::<Value>(raw) else {
            return None;
        };
        let kind = message.get("type").and_then(Value::as_str).unwrap_or("unknown");
        info!("received draw message: {kind}");
        Some(DrawAck {
            kind: "draw_ack",
            timestamp: message.get("timestamp").cloned().unwrap_or(Value::Null),
            status: "received",
        })
    }

    /// Serves one connection until it closes or errors.
    pub async fn serve(&self, mut socket: WebSocket) {
        let id = self.join();
        while let Some(message) = socket.recv().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("draw socket error: {e}");
                    break;
                }
            };
            let Some(ack) = Self::acknowledge(text.as_str()) else {
                warn!("ignoring malformed draw message");
                continue;
            };
            let payload = match serde_json::to_string(&ack) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to encode draw ack: {e}");
                    continue;
                }
            };
            if socket.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
        self.leave(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn acknowledges_with_echoed_timestamp() {
        let ack = DrawRelay::acknowledge(r#"{"type":"stroke","timestamp":1712,"points":[]}"#)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "draw_ack", "timestamp": 1712, "status": "received"})
        );
    }

    #[test]
    fn missing_timestamp_is_null() {
        let ack = DrawRelay::acknowledge(r#"{"type":"clear"}"#).unwrap();
        assert_eq!(ack.timestamp, Value::Null);
    }

    #[test]
    fn malformed_input_gets_no_ack() {
        assert_eq!(DrawRelay::acknowledge("{not json"), None);
        assert_eq!(DrawRelay::acknowledge("[1, 2, 3]"), None);
    }

    #[test]
    fn membership_tracks_join_and_leave() {
        let relay = DrawRelay::default();
        let a = relay.join();
        let b = relay.join();
        assert_eq!(relay.connections(), 2);
        relay.leave(a);
        relay.leave(a);
        assert_eq!(relay.connections(), 1);
        relay.leave(b);
        assert_eq!(relay.connections(), 0);
    }
}
