use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::Connection;

/// Where a message entered the system from. Inbound channels tag every
/// message with their direction before it reaches the pipeline.
/// `FromExternal` marks copies relayed by another node on behalf of a remote
/// participant and is treated like `FromPeer` for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    FromOwner,
    FromPeer,
    FromMatcher,
    FromSystem,
    FromExternal,
}

impl Direction {
    /// Originated on this node (owner agent or the node itself).
    pub fn is_local(self) -> bool {
        matches!(self, Direction::FromOwner | Direction::FromSystem)
    }

    /// Originated on a remote node.
    pub fn is_remote(self) -> bool {
        matches!(self, Direction::FromPeer | Direction::FromExternal)
    }
}

/// Closed enumeration of recognized message types. Each type declares which
/// directions are legal for it, whether it targets or creates a connection,
/// whether processing it must produce a remote copy, and whether it is
/// itself a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    CreateParticipant,
    Activate,
    Deactivate,
    ConnectionOpen,
    ConnectionClose,
    ConnectionMessage,
    Hint,
    Response,
}

impl MessageType {
    pub fn legal_directions(self) -> &'static [Direction] {
        use Direction::*;
        match self {
            MessageType::CreateParticipant => &[FromOwner],
            MessageType::Activate | MessageType::Deactivate => &[FromOwner, FromSystem],
            MessageType::ConnectionOpen
            | MessageType::ConnectionClose
            | MessageType::ConnectionMessage => &[FromOwner, FromSystem, FromPeer, FromExternal],
            MessageType::Hint => &[FromMatcher],
            MessageType::Response => &[FromPeer, FromExternal, FromSystem],
        }
    }

    /// Targets a connection's state machine.
    pub fn targets_connection(self) -> bool {
        matches!(
            self,
            MessageType::ConnectionOpen
                | MessageType::ConnectionClose
                | MessageType::ConnectionMessage
        )
    }

    /// May create the connection it references during parent resolution.
    pub fn creates_connection(self) -> bool {
        matches!(self, MessageType::ConnectionOpen | MessageType::Hint)
    }

    /// Must produce a copy for the remote side of the connection.
    pub fn causes_outgoing_message(self) -> bool {
        matches!(
            self,
            MessageType::ConnectionOpen
                | MessageType::ConnectionClose
                | MessageType::ConnectionMessage
        )
    }

    pub fn is_response_message(self) -> bool {
        matches!(self, MessageType::Response)
    }

    /// Carries a correlation id referencing the message being responded to.
    pub fn carries_correlation(self) -> bool {
        self.is_response_message()
    }
}

/// Per-message suppression flags. Set by the sender or by a reaction handler
/// to cut individual hops out of the routing slip; `reaction` prevents echo
/// loops when a node processes messages it generated itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressFlags {
    #[serde(default)]
    pub reaction: bool,
    #[serde(default)]
    pub forward_to_owner: bool,
    #[serde(default)]
    pub forward_to_peer: bool,
}

/// A directed message. Immutable once created; the pipeline never mutates a
/// message after classification, it only derives new ones (responses,
/// forwards, cascade closes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub direction: Direction,
    pub sender_id: String,
    #[serde(default)]
    pub sender_connection_id: Option<String>,
    /// Node that originated the message; set on remote-origin messages and
    /// used to address the response.
    #[serde(default)]
    pub sender_node_id: Option<String>,
    pub receiver_id: String,
    #[serde(default)]
    pub receiver_connection_id: Option<String>,
    /// Node this message is addressed to. Must be the local node.
    pub receiver_node_id: String,
    /// Node hosting the counterpart participant; required when a
    /// ConnectionOpen or Hint has to create the connection.
    #[serde(default)]
    pub remote_node_id: Option<String>,
    /// For Response messages: the id of the message being responded to.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub suppress: SuppressFlags,
    /// For Response messages: whether the correlated message succeeded.
    #[serde(default)]
    pub success: Option<bool>,
}

impl Message {
    /// The connection id on *this* node that the message refers to:
    /// sender side for locally originated messages, receiver side for
    /// remote-origin ones.
    pub fn local_connection_id(&self) -> Option<&str> {
        if self.direction.is_remote() {
            self.receiver_connection_id.as_deref()
        } else {
            self.sender_connection_id.as_deref()
        }
    }

    /// The participant on this node the message acts on behalf of / targets.
    pub fn local_participant_id(&self) -> &str {
        if self.direction.is_local() {
            &self.sender_id
        } else {
            &self.receiver_id
        }
    }

    /// Success or failure acknowledgment for this message, generated by the
    /// node. Addressed back to the sender; for remote-origin messages the
    /// response travels to the originating node.
    pub fn response_to(
        original: &Message,
        response_id: String,
        local_node_id: &str,
        success: bool,
        payload: serde_json::Value,
    ) -> Message {
        Message {
            id: response_id,
            message_type: MessageType::Response,
            direction: Direction::FromSystem,
            sender_id: original.receiver_id.clone(),
            sender_connection_id: original.receiver_connection_id.clone(),
            sender_node_id: Some(local_node_id.to_string()),
            receiver_id: original.sender_id.clone(),
            receiver_connection_id: original.sender_connection_id.clone(),
            receiver_node_id: original
                .sender_node_id
                .clone()
                .unwrap_or_else(|| local_node_id.to_string()),
            remote_node_id: None,
            correlation_id: Some(original.id.clone()),
            payload,
            timestamp: Utc::now(),
            suppress: SuppressFlags::default(),
            success: Some(success),
        }
    }

    /// System-generated close for a connection, used by the deactivation
    /// cascade. Processed through the from-system channel like any other
    /// message; reaction is suppressed to keep the cascade from feeding
    /// itself.
    pub fn close_for_connection(
        connection: &Connection,
        message_id: String,
        local_node_id: &str,
    ) -> Message {
        Message {
            id: message_id,
            message_type: MessageType::ConnectionClose,
            direction: Direction::FromSystem,
            sender_id: connection.participant_id.clone(),
            sender_connection_id: Some(connection.id.clone()),
            sender_node_id: Some(local_node_id.to_string()),
            receiver_id: connection
                .remote_participant_id
                .clone()
                .unwrap_or_else(|| connection.participant_id.clone()),
            receiver_connection_id: connection.remote_connection_id.clone(),
            receiver_node_id: local_node_id.to_string(),
            remote_node_id: connection.remote_node_id.clone(),
            correlation_id: None,
            payload: serde_json::json!({ "reason": "participant deactivated" }),
            timestamp: Utc::now(),
            suppress: SuppressFlags {
                reaction: true,
                ..SuppressFlags::default()
            },
            success: None,
        }
    }

    /// Copy of a committed message addressed to the remote side of its
    /// connection. Gets a fresh id; the ledger links it back to the original
    /// so the peer's response correlates.
    pub fn forward_for_peer(
        original: &Message,
        connection: &Connection,
        forward_id: String,
        remote_node_id: &str,
    ) -> Message {
        Message {
            id: forward_id,
            message_type: original.message_type,
            direction: Direction::FromPeer,
            sender_id: connection.participant_id.clone(),
            sender_connection_id: Some(connection.id.clone()),
            sender_node_id: Some(original.receiver_node_id.clone()),
            receiver_id: connection
                .remote_participant_id
                .clone()
                .unwrap_or_else(|| original.receiver_id.clone()),
            receiver_connection_id: connection.remote_connection_id.clone(),
            receiver_node_id: remote_node_id.to_string(),
            remote_node_id: None,
            correlation_id: None,
            payload: original.payload.clone(),
            timestamp: Utc::now(),
            suppress: SuppressFlags::default(),
            success: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_is_matcher_only() {
        assert_eq!(MessageType::Hint.legal_directions(), &[Direction::FromMatcher]);
        assert!(!MessageType::Hint.legal_directions().contains(&Direction::FromOwner));
    }

    #[test]
    fn connection_types_cause_outgoing_messages() {
        assert!(MessageType::ConnectionOpen.causes_outgoing_message());
        assert!(MessageType::ConnectionClose.causes_outgoing_message());
        assert!(MessageType::ConnectionMessage.causes_outgoing_message());
        assert!(!MessageType::Hint.causes_outgoing_message());
        assert!(!MessageType::Response.causes_outgoing_message());
        assert!(!MessageType::Deactivate.causes_outgoing_message());
    }

    #[test]
    fn only_responses_carry_correlation() {
        for t in [
            MessageType::CreateParticipant,
            MessageType::Activate,
            MessageType::Deactivate,
            MessageType::ConnectionOpen,
            MessageType::ConnectionClose,
            MessageType::ConnectionMessage,
            MessageType::Hint,
        ] {
            assert!(!t.carries_correlation(), "{t:?} must not carry correlation");
        }
        assert!(MessageType::Response.carries_correlation());
    }

    #[test]
    fn suppress_flags_default_to_off() {
        let flags = SuppressFlags::default();
        assert!(!flags.reaction && !flags.forward_to_owner && !flags.forward_to_peer);
    }
}
