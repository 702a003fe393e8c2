// ============================================================================
// Message Classifier & Validator
// ============================================================================
//
// Ordered, fail-fast checks applied before a message may touch any state:
// 1. well-formedness (required fields for the declared type)
// 2. addressing (the receiver node must be this node)
// 3. parent resolution (resolve or create the target connection, lock it)
// 4. duplicate check (replay the stored response for known ids)
// 5. signature/authorization (external verifier, fail closed)
//
// Steps 1 and 2 are stateless. Step 3 acquires the per-connection update
// lock that serializes all further processing for that connection.
// ============================================================================

use tokio::sync::OwnedMutexGuard;

use crate::connection::{Connection, ConnectionState};
use crate::context::NodeContext;
use crate::error::{ProcessingError, ProcessingResult};
use crate::message::{Message, MessageType};

/// Outcome of classification.
pub enum Classification {
    /// The id was already processed and answered; re-send the stored
    /// response instead of reprocessing.
    Replay { response: Message },
    /// Validated and ready for the pipeline.
    Process(ValidatedMessage),
}

pub struct ValidatedMessage {
    pub message: Message,
    /// Update lock on the target connection, held through commit.
    pub connection: Option<OwnedMutexGuard<Connection>>,
    /// True when parent resolution created the connection; it is discarded
    /// again if the run aborts before commit.
    pub created_connection: bool,
}

pub async fn classify(ctx: &NodeContext, message: Message) -> ProcessingResult<Classification> {
    check_well_formed(&message)?;
    check_addressing(ctx, &message)?;

    let (connection, created_connection) = resolve_parent(ctx, &message).await?;

    // Steps 4 and 5 run with the connection lock held; on failure a created
    // connection must not survive the abort.
    match validate_resolved(ctx, &message).await {
        Ok(Some(response)) => {
            if created_connection {
                discard_created(ctx, connection).await;
            }
            Ok(Classification::Replay { response })
        }
        Ok(None) => Ok(Classification::Process(ValidatedMessage {
            message,
            connection,
            created_connection,
        })),
        Err(err) => {
            if created_connection {
                discard_created(ctx, connection).await;
            }
            Err(err)
        }
    }
}

async fn discard_created(ctx: &NodeContext, connection: Option<OwnedMutexGuard<Connection>>) {
    if let Some(guard) = connection {
        let id = guard.id.clone();
        drop(guard);
        ctx.connections.discard(&id).await;
    }
}

/// Steps 4 and 5. Returns `Some(response)` when the duplicate check finds a
/// completed entry to replay.
async fn validate_resolved(
    ctx: &NodeContext,
    message: &Message,
) -> ProcessingResult<Option<Message>> {
    if let Some((_, Some(response), _)) = ctx.ledger.lookup_direct(&message.id).await? {
        tracing::info!(
            message_id = %message.id,
            "Duplicate delivery, replaying stored response"
        );
        return Ok(Some(response));
    }

    match ctx.verifier.verify(message).await {
        Ok(true) => Ok(None),
        Ok(false) => Err(ProcessingError::Unauthorized(message.id.clone())),
        Err(err) => Err(ProcessingError::Unauthorized(format!(
            "{}: verifier failed: {err}",
            message.id
        ))),
    }
}

/// Step 1: structural completeness for the declared type.
pub fn check_well_formed(message: &Message) -> ProcessingResult<()> {
    if message.id.is_empty() {
        return Err(ProcessingError::malformed("missing message id"));
    }
    if message.sender_id.is_empty() || message.receiver_id.is_empty() {
        return Err(ProcessingError::malformed(format!(
            "{}: sender and receiver are required",
            message.id
        )));
    }
    if message.receiver_node_id.is_empty() {
        return Err(ProcessingError::malformed(format!(
            "{}: receiver node is required",
            message.id
        )));
    }
    let message_type = message.message_type;
    if !message_type
        .legal_directions()
        .contains(&message.direction)
    {
        return Err(ProcessingError::malformed(format!(
            "{}: direction {:?} is not legal for {message_type:?}",
            message.id, message.direction
        )));
    }
    if message_type.carries_correlation() {
        if message.correlation_id.is_none() {
            return Err(ProcessingError::malformed(format!(
                "{}: Response requires a correlation id",
                message.id
            )));
        }
        if message.success.is_none() {
            return Err(ProcessingError::malformed(format!(
                "{}: Response requires a success flag",
                message.id
            )));
        }
    } else if message.correlation_id.is_some() {
        return Err(ProcessingError::malformed(format!(
            "{}: {message_type:?} must not carry a correlation id",
            message.id
        )));
    }
    if message.direction.is_remote() && message.sender_node_id.is_none() {
        return Err(ProcessingError::malformed(format!(
            "{}: remote-origin messages require a sender node",
            message.id
        )));
    }
    match message_type {
        MessageType::CreateParticipant => {
            if owner_app_of(message).is_none() {
                return Err(ProcessingError::malformed(format!(
                    "{}: CreateParticipant requires payload field \"owner_app\"",
                    message.id
                )));
            }
        }
        MessageType::ConnectionClose | MessageType::ConnectionMessage => {
            if message.local_connection_id().is_none() {
                return Err(ProcessingError::malformed(format!(
                    "{}: {message_type:?} requires a connection reference",
                    message.id
                )));
            }
        }
        MessageType::ConnectionOpen => {
            if message.local_connection_id().is_none() {
                // creating: we must know where the counterpart lives
                if message.direction.is_local() && message.remote_node_id.is_none() {
                    return Err(ProcessingError::malformed(format!(
                        "{}: ConnectionOpen without a connection requires the remote node",
                        message.id
                    )));
                }
                if message.direction.is_remote() && message.sender_connection_id.is_none() {
                    return Err(ProcessingError::malformed(format!(
                        "{}: ConnectionOpen from a peer requires the sender connection",
                        message.id
                    )));
                }
            }
        }
        MessageType::Hint => {
            if message.remote_node_id.is_none() || counterpart_of(message).is_none() {
                return Err(ProcessingError::malformed(format!(
                    "{}: Hint requires the counterpart participant and node",
                    message.id
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Step 2: the stated receiver node must be this node.
fn check_addressing(ctx: &NodeContext, message: &Message) -> ProcessingResult<()> {
    if message.receiver_node_id != ctx.config.node_id {
        return Err(ProcessingError::WrongNode {
            message_id: message.id.clone(),
            receiver_node: message.receiver_node_id.clone(),
            local_node: ctx.config.node_id.clone(),
        });
    }
    Ok(())
}

/// Step 3: resolve the target connection and lock it, creating it for the
/// types that may do so.
async fn resolve_parent(
    ctx: &NodeContext,
    message: &Message,
) -> ProcessingResult<(Option<OwnedMutexGuard<Connection>>, bool)> {
    match message.message_type {
        t if t.targets_connection() => match message.local_connection_id() {
            Some(id) => {
                let guard = ctx
                    .connections
                    .lock_for_update(id)
                    .await?
                    .ok_or_else(|| ProcessingError::UnknownConnection(id.to_string()))?;
                Ok((Some(guard), false))
            }
            None if t.creates_connection() => {
                let guard = create_for_open(ctx, message).await?;
                Ok((Some(guard), true))
            }
            None => Err(ProcessingError::malformed(format!(
                "{}: {t:?} requires a connection reference",
                message.id
            ))),
        },
        MessageType::Hint => {
            let guard = create_for_hint(ctx, message).await?;
            Ok((Some(guard), true))
        }
        MessageType::Activate | MessageType::Deactivate => {
            require_participant(ctx, &message.receiver_id).await?;
            Ok((None, false))
        }
        _ => Ok((None, false)),
    }
}

async fn create_for_open(
    ctx: &NodeContext,
    message: &Message,
) -> ProcessingResult<OwnedMutexGuard<Connection>> {
    let participant_id = message.local_participant_id();
    require_participant(ctx, participant_id).await?;

    let mut connection = Connection::new(
        ctx.config.new_connection_id(),
        participant_id.to_string(),
        ConnectionState::initial_for(message.direction),
    );
    if message.direction.is_local() {
        connection.set_remote(
            Some(&message.receiver_id),
            None,
            message.remote_node_id.as_deref(),
        )?;
    } else {
        connection.set_remote(
            Some(&message.sender_id),
            message.sender_connection_id.as_deref(),
            message.sender_node_id.as_deref(),
        )?;
    }
    ctx.connections.create(connection).await
}

async fn create_for_hint(
    ctx: &NodeContext,
    message: &Message,
) -> ProcessingResult<OwnedMutexGuard<Connection>> {
    require_participant(ctx, &message.receiver_id).await?;

    let mut connection = Connection::new(
        ctx.config.new_connection_id(),
        message.receiver_id.clone(),
        ConnectionState::Suggested,
    );
    connection.set_remote(
        counterpart_of(message).as_deref(),
        None,
        message.remote_node_id.as_deref(),
    )?;
    ctx.connections.create(connection).await
}

async fn require_participant(ctx: &NodeContext, id: &str) -> ProcessingResult<()> {
    if !ctx.participants.exists(id).await? {
        return Err(ProcessingError::UnknownParticipant(id.to_string()));
    }
    Ok(())
}

pub fn owner_app_of(message: &Message) -> Option<String> {
    message
        .payload
        .get("owner_app")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

pub fn counterpart_of(message: &Message) -> Option<String> {
    message
        .payload
        .get("counterpart_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Direction, SuppressFlags};
    use chrono::Utc;

    fn base(message_type: MessageType, direction: Direction) -> Message {
        Message {
            id: "msg:1".into(),
            message_type,
            direction,
            sender_id: "participant:1".into(),
            sender_connection_id: None,
            sender_node_id: None,
            receiver_id: "participant:2".into(),
            receiver_connection_id: None,
            receiver_node_id: "node:local".into(),
            remote_node_id: None,
            correlation_id: None,
            payload: serde_json::json!({}),
            timestamp: Utc::now(),
            suppress: SuppressFlags::default(),
            success: None,
        }
    }

    #[test]
    fn hint_from_owner_is_malformed() {
        let mut msg = base(MessageType::Hint, Direction::FromOwner);
        msg.remote_node_id = Some("node:b".into());
        msg.payload = serde_json::json!({"counterpart_id": "participant:9"});
        assert!(matches!(
            check_well_formed(&msg).unwrap_err(),
            ProcessingError::MalformedMessage(_)
        ));
    }

    #[test]
    fn conversation_without_connection_reference_is_malformed() {
        let msg = base(MessageType::ConnectionMessage, Direction::FromOwner);
        assert!(check_well_formed(&msg).is_err());
    }

    #[test]
    fn response_requires_correlation_and_success() {
        let mut msg = base(MessageType::Response, Direction::FromPeer);
        msg.sender_node_id = Some("node:b".into());
        assert!(check_well_formed(&msg).is_err());
        msg.correlation_id = Some("msg:0".into());
        assert!(check_well_formed(&msg).is_err());
        msg.success = Some(true);
        assert!(check_well_formed(&msg).is_ok());
    }

    #[test]
    fn correlation_on_non_response_is_malformed() {
        let mut msg = base(MessageType::ConnectionMessage, Direction::FromOwner);
        msg.sender_connection_id = Some("conn:1".into());
        msg.correlation_id = Some("msg:0".into());
        assert!(check_well_formed(&msg).is_err());
    }

    #[test]
    fn peer_messages_require_sender_node() {
        let mut msg = base(MessageType::ConnectionOpen, Direction::FromPeer);
        msg.sender_connection_id = Some("conn:remote".into());
        assert!(check_well_formed(&msg).is_err());
        msg.sender_node_id = Some("node:b".into());
        assert!(check_well_formed(&msg).is_ok());
    }

    #[test]
    fn owner_open_without_connection_needs_remote_node() {
        let msg = base(MessageType::ConnectionOpen, Direction::FromOwner);
        assert!(check_well_formed(&msg).is_err());
        let mut msg = base(MessageType::ConnectionOpen, Direction::FromOwner);
        msg.remote_node_id = Some("node:b".into());
        assert!(check_well_formed(&msg).is_ok());
    }
}
