use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, ProcessingResult};
use crate::message::{Direction, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    RequestSent,
    RequestReceived,
    Connected,
    Closed,
    Suggested,
}

impl ConnectionState {
    /// Closed is terminal: a connection never leaves it.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Initial state of a connection created by `message` — depends on who
    /// initiated: the local side, the remote side, or a matcher hint.
    pub fn initial_for(direction: Direction) -> ConnectionState {
        match direction {
            Direction::FromOwner | Direction::FromSystem => ConnectionState::RequestSent,
            Direction::FromPeer | Direction::FromExternal => ConnectionState::RequestReceived,
            Direction::FromMatcher => ConnectionState::Suggested,
        }
    }
}

/// The legal transition table, (current state, message type, direction) to
/// next state. Any pair not covered here is illegal for the connection and
/// rejected with `IllegalMessageForState` — reported, non-fatal.
pub fn transition_for(
    connection: &Connection,
    message_type: MessageType,
    direction: Direction,
) -> ProcessingResult<ConnectionState> {
    use ConnectionState::*;
    let next = match (connection.state, message_type) {
        // the counterpart accepts our request
        (RequestSent, MessageType::ConnectionOpen) if direction.is_remote() => Some(Connected),
        // the local participant accepts the counterpart's request
        (RequestReceived, MessageType::ConnectionOpen) if direction.is_local() => Some(Connected),
        // a hinted connection is promoted to a request by whichever side opens
        (Suggested, MessageType::ConnectionOpen) if direction.is_local() => Some(RequestSent),
        (Suggested, MessageType::ConnectionOpen) if direction.is_remote() => Some(RequestReceived),
        // close / reject is legal from every non-terminal state
        (RequestSent, MessageType::ConnectionClose)
        | (RequestReceived, MessageType::ConnectionClose)
        | (Suggested, MessageType::ConnectionClose)
        | (Connected, MessageType::ConnectionClose) => Some(Closed),
        // conversation requires an established connection
        (Connected, MessageType::ConnectionMessage) => Some(Connected),
        _ => None,
    };
    next.ok_or_else(|| ProcessingError::IllegalMessageForState {
        connection_id: connection.id.clone(),
        state: connection.state,
        message_type,
    })
}

/// One endpoint of a bilateral relationship between two participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub participant_id: String,
    #[serde(default)]
    pub remote_participant_id: Option<String>,
    #[serde(default)]
    pub remote_connection_id: Option<String>,
    #[serde(default)]
    pub remote_node_id: Option<String>,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(id: String, participant_id: String, state: ConnectionState) -> Connection {
        Connection {
            id,
            participant_id,
            remote_participant_id: None,
            remote_connection_id: None,
            remote_node_id: None,
            state,
            created_at: Utc::now(),
        }
    }

    /// Move to `next`. Guards the terminal invariant independently of the
    /// transition table: leaving Closed is an `IllegalTransition` even if a
    /// caller bypassed `transition_for`.
    pub fn set_state(&mut self, next: ConnectionState) -> ProcessingResult<()> {
        if self.state.is_terminal() && next != self.state {
            return Err(ProcessingError::IllegalTransition {
                connection_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record the remote side's identifiers. Write-once: once set they never
    /// change; a message carrying conflicting values is rejected.
    pub fn set_remote(
        &mut self,
        participant_id: Option<&str>,
        connection_id: Option<&str>,
        node_id: Option<&str>,
    ) -> ProcessingResult<()> {
        fn bind(
            slot: &mut Option<String>,
            value: Option<&str>,
            what: &str,
            connection_id: &str,
        ) -> ProcessingResult<()> {
            match (slot.as_deref(), value) {
                (_, None) => Ok(()),
                (None, Some(v)) => {
                    *slot = Some(v.to_string());
                    Ok(())
                }
                (Some(existing), Some(v)) if existing == v => Ok(()),
                (Some(existing), Some(v)) => Err(ProcessingError::malformed(format!(
                    "remote {what} of connection {connection_id} is already bound to {existing}, cannot rebind to {v}"
                ))),
            }
        }
        let id = self.id.clone();
        bind(&mut self.remote_participant_id, participant_id, "participant", &id)?;
        bind(&mut self.remote_connection_id, connection_id, "connection", &id)?;
        bind(&mut self.remote_node_id, node_id, "node", &id)?;
        Ok(())
    }

    pub fn closes_on_deactivate(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(state: ConnectionState) -> Connection {
        Connection::new("conn:1".into(), "participant:1".into(), state)
    }

    #[test]
    fn peer_open_connects_a_sent_request() {
        let c = conn(ConnectionState::RequestSent);
        let next =
            transition_for(&c, MessageType::ConnectionOpen, Direction::FromPeer).unwrap();
        assert_eq!(next, ConnectionState::Connected);
    }

    #[test]
    fn owner_open_connects_a_received_request() {
        let c = conn(ConnectionState::RequestReceived);
        let next =
            transition_for(&c, MessageType::ConnectionOpen, Direction::FromOwner).unwrap();
        assert_eq!(next, ConnectionState::Connected);
    }

    #[test]
    fn suggested_promotes_on_open() {
        let c = conn(ConnectionState::Suggested);
        assert_eq!(
            transition_for(&c, MessageType::ConnectionOpen, Direction::FromOwner).unwrap(),
            ConnectionState::RequestSent
        );
        assert_eq!(
            transition_for(&c, MessageType::ConnectionOpen, Direction::FromPeer).unwrap(),
            ConnectionState::RequestReceived
        );
    }

    #[test]
    fn close_is_legal_from_every_non_terminal_state() {
        for state in [
            ConnectionState::RequestSent,
            ConnectionState::RequestReceived,
            ConnectionState::Suggested,
            ConnectionState::Connected,
        ] {
            let c = conn(state);
            assert_eq!(
                transition_for(&c, MessageType::ConnectionClose, Direction::FromOwner).unwrap(),
                ConnectionState::Closed
            );
        }
    }

    #[test]
    fn conversation_requires_connected() {
        for state in [
            ConnectionState::RequestSent,
            ConnectionState::RequestReceived,
            ConnectionState::Suggested,
            ConnectionState::Closed,
        ] {
            let c = conn(state);
            let err = transition_for(&c, MessageType::ConnectionMessage, Direction::FromOwner)
                .unwrap_err();
            match err {
                ProcessingError::IllegalMessageForState {
                    state: s,
                    message_type,
                    ..
                } => {
                    assert_eq!(s, state);
                    assert_eq!(message_type, MessageType::ConnectionMessage);
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn closed_is_terminal() {
        let c = conn(ConnectionState::Closed);
        assert!(transition_for(&c, MessageType::ConnectionOpen, Direction::FromPeer).is_err());
        assert!(transition_for(&c, MessageType::ConnectionClose, Direction::FromOwner).is_err());

        let mut c = c;
        let err = c.set_state(ConnectionState::Connected).unwrap_err();
        assert!(matches!(err, ProcessingError::IllegalTransition { .. }));
    }

    #[test]
    fn remote_identifiers_are_write_once() {
        let mut c = conn(ConnectionState::RequestSent);
        c.set_remote(Some("participant:2"), Some("conn:remote"), Some("node:b"))
            .unwrap();
        // idempotent rebind with identical values is fine
        c.set_remote(Some("participant:2"), None, None).unwrap();
        let err = c
            .set_remote(Some("participant:3"), None, None)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedMessage(_)));
        assert_eq!(c.remote_participant_id.as_deref(), Some("participant:2"));
    }
}
