//! Wire control messages.
//!
//! ## Message protocol
//!
//! Every WebSocket frame between a client and the relay is one of two
//! things:
//!
//! - **Text**: a JSON control message, tagged by `type`:
//!   - `{"type": "ping"}` (client → relay)
//!   - `{"type": "pong", "timestamp": ...}` (relay → client)
//!   - `{"type": "room-info", "roomId": ..., "clientCount": ...,
//!     "clientId"?: ...}` (relay → client, on join and on every membership
//!     change; `clientId` only in the copy sent to the joining client)
//! - **Binary**: a delta frame ([`crate::Delta`]), no envelope. Frames at or
//!   below the no-op threshold are dropped by both ends.
//!
//! Relay-side liveness rides on WebSocket protocol Ping/Pong, not on these
//! control messages.

use serde::{Deserialize, Serialize};

/// A control message. Text frames that fail to parse as this enum are
/// silently dropped as expected wire noise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Control {
    /// Client-initiated keepalive.
    Ping,
    /// Relay's immediate answer to a ping.
    Pong {
        /// Relay wall-clock time (ms since epoch).
        timestamp: u64,
    },
    /// Room membership notification.
    #[serde(rename_all = "camelCase")]
    RoomInfo {
        /// The room this connection is scoped to.
        room_id: String,
        /// Number of live connections in the room.
        client_count: usize,
        /// The receiver's own client id; present only on join.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
}

impl Control {
    /// Serialize to the wire representation.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a text frame. Returns `None` for anything that is not a
    /// well-formed control message.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_wire_shape() {
        assert_eq!(Control::Ping.to_json(), r#"{"type":"ping"}"#);
        assert_eq!(Control::parse(r#"{"type":"ping"}"#), Some(Control::Ping));
    }

    #[test]
    fn pong_carries_timestamp() {
        let json = Control::Pong { timestamp: 42 }.to_json();
        assert_eq!(json, r#"{"type":"pong","timestamp":42}"#);
    }

    #[test]
    fn room_info_uses_camel_case_fields() {
        let json = Control::RoomInfo {
            room_id: "r1".into(),
            client_count: 2,
            client_id: Some("c1".into()),
        }
        .to_json();
        assert_eq!(
            json,
            r#"{"type":"room-info","roomId":"r1","clientCount":2,"clientId":"c1"}"#
        );
    }

    #[test]
    fn room_info_omits_absent_client_id() {
        let json = Control::RoomInfo {
            room_id: "r1".into(),
            client_count: 1,
            client_id: None,
        }
        .to_json();
        assert!(!json.contains("clientId"));

        let parsed = Control::parse(&json).expect("parse");
        assert_eq!(
            parsed,
            Control::RoomInfo {
                room_id: "r1".into(),
                client_count: 1,
                client_id: None,
            }
        );
    }

    #[test]
    fn noise_is_not_a_control_message() {
        assert_eq!(Control::parse("not json"), None);
        assert_eq!(Control::parse(r#"{"type":"launch-missiles"}"#), None);
        assert_eq!(Control::parse("[1,2,3]"), None);
    }
}
