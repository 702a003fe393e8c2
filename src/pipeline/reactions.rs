// ============================================================================
// Reaction Handler Registry
// ============================================================================
//
// Type-specific processing, keyed by (direction class, message type) with a
// default no-op. A handler runs inside the transaction (step 3 of the
// pipeline) and only *stages* effects; nothing it produces is visible before
// commit. The post-commit `react` hook runs in its own failure scope as the
// react-locally hop.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use crate::classifier::owner_app_of;
use crate::connection::{Connection, ConnectionState};
use crate::context::NodeContext;
use crate::error::{ProcessingError, ProcessingResult};
use crate::message::{Direction, Message, MessageType, SuppressFlags};
use crate::participant::{Participant, ParticipantState};

/// Effects staged by the state machine step and the reaction handler,
/// applied together at commit.
#[derive(Default)]
pub struct StagedEffects {
    /// State the target connection moves to.
    pub connection_state: Option<ConnectionState>,
    /// Remote identifiers to bind on the connection (write-once).
    pub remote_participant_id: Option<String>,
    pub remote_connection_id: Option<String>,
    pub remote_node_id: Option<String>,
    /// Participant to create.
    pub participant_upsert: Option<Participant>,
    /// Participant lifecycle change.
    pub participant_state: Option<(String, ParticipantState)>,
    /// System messages to feed back through the from-system channel after
    /// commit (deactivation cascade).
    pub followups: Vec<Message>,
    /// Suppression flags overriding the message's own for the routing slip.
    pub suppress: Option<SuppressFlags>,
    /// Abort without commit and without error; used to drop unwanted hints.
    pub ignore: bool,
}

#[async_trait::async_trait]
pub trait ReactionHandler: Send + Sync {
    /// In-transaction, staging only.
    async fn process(
        &self,
        ctx: &NodeContext,
        message: &Message,
        connection: Option<&Connection>,
        staged: &mut StagedEffects,
    ) -> ProcessingResult<()>;

    /// Post-commit local reaction (the react-locally hop).
    async fn react(&self, _ctx: &NodeContext, _message: &Message) -> ProcessingResult<()> {
        Ok(())
    }
}

/// Registry key: handlers distinguish local, remote and matcher origin, not
/// the five concrete directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectionClass {
    Local,
    Remote,
    Matcher,
}

impl From<Direction> for DirectionClass {
    fn from(direction: Direction) -> DirectionClass {
        match direction {
            Direction::FromOwner | Direction::FromSystem => DirectionClass::Local,
            Direction::FromPeer | Direction::FromExternal => DirectionClass::Remote,
            Direction::FromMatcher => DirectionClass::Matcher,
        }
    }
}

pub struct ReactionRegistry {
    handlers: HashMap<(DirectionClass, MessageType), Arc<dyn ReactionHandler>>,
    fallback: Arc<dyn ReactionHandler>,
}

impl ReactionRegistry {
    pub fn new() -> ReactionRegistry {
        ReactionRegistry {
            handlers: HashMap::new(),
            fallback: Arc::new(NoopReaction),
        }
    }

    /// Registry with the standard handler set.
    pub fn standard() -> ReactionRegistry {
        let mut registry = ReactionRegistry::new();
        registry.register(
            DirectionClass::Local,
            MessageType::CreateParticipant,
            Arc::new(CreateParticipantReaction),
        );
        registry.register(
            DirectionClass::Local,
            MessageType::Activate,
            Arc::new(LifecycleReaction {
                target: ParticipantState::Active,
            }),
        );
        registry.register(
            DirectionClass::Local,
            MessageType::Deactivate,
            Arc::new(DeactivateReaction),
        );
        registry.register(
            DirectionClass::Remote,
            MessageType::ConnectionOpen,
            Arc::new(RemoteOpenReaction),
        );
        registry.register(
            DirectionClass::Matcher,
            MessageType::Hint,
            Arc::new(HintReaction),
        );
        registry
    }

    pub fn register(
        &mut self,
        class: DirectionClass,
        message_type: MessageType,
        handler: Arc<dyn ReactionHandler>,
    ) {
        self.handlers.insert((class, message_type), handler);
    }

    fn handler_for(&self, message: &Message) -> &Arc<dyn ReactionHandler> {
        self.handlers
            .get(&(message.direction.into(), message.message_type))
            .unwrap_or(&self.fallback)
    }

    pub async fn process(
        &self,
        ctx: &NodeContext,
        message: &Message,
        connection: Option<&Connection>,
        staged: &mut StagedEffects,
    ) -> ProcessingResult<()> {
        self.handler_for(message)
            .process(ctx, message, connection, staged)
            .await
    }

    pub async fn react(&self, ctx: &NodeContext, message: &Message) -> ProcessingResult<()> {
        self.handler_for(message).react(ctx, message).await
    }
}

impl Default for ReactionRegistry {
    fn default() -> Self {
        ReactionRegistry::new()
    }
}

struct NoopReaction;

#[async_trait::async_trait]
impl ReactionHandler for NoopReaction {
    async fn process(
        &self,
        _ctx: &NodeContext,
        _message: &Message,
        _connection: Option<&Connection>,
        _staged: &mut StagedEffects,
    ) -> ProcessingResult<()> {
        Ok(())
    }
}

/// CreateParticipant: stage the new participant record. The matcher learns
/// about it post-commit.
struct CreateParticipantReaction;

#[async_trait::async_trait]
impl ReactionHandler for CreateParticipantReaction {
    async fn process(
        &self,
        ctx: &NodeContext,
        message: &Message,
        _connection: Option<&Connection>,
        staged: &mut StagedEffects,
    ) -> ProcessingResult<()> {
        if ctx.participants.exists(&message.sender_id).await? {
            return Err(ProcessingError::malformed(format!(
                "participant id already in use: {}",
                message.sender_id
            )));
        }
        let owner_app = owner_app_of(message).ok_or_else(|| {
            ProcessingError::malformed(format!(
                "{}: CreateParticipant requires payload field \"owner_app\"",
                message.id
            ))
        })?;
        staged.participant_upsert = Some(Participant::new(message.sender_id.clone(), owner_app));
        Ok(())
    }

    async fn react(&self, ctx: &NodeContext, message: &Message) -> ProcessingResult<()> {
        ctx.dispatcher.notify_matcher(ctx, message).await
    }
}

/// Activate: plain lifecycle change plus matcher notification.
struct LifecycleReaction {
    target: ParticipantState,
}

#[async_trait::async_trait]
impl ReactionHandler for LifecycleReaction {
    async fn process(
        &self,
        _ctx: &NodeContext,
        message: &Message,
        _connection: Option<&Connection>,
        staged: &mut StagedEffects,
    ) -> ProcessingResult<()> {
        staged.participant_state = Some((message.receiver_id.clone(), self.target));
        Ok(())
    }

    async fn react(&self, ctx: &NodeContext, message: &Message) -> ProcessingResult<()> {
        ctx.dispatcher.notify_matcher(ctx, message).await
    }
}

/// Deactivate: lifecycle change plus a close cascade. Every open connection
/// of the participant gets a system ConnectionClose fed back through the
/// from-system channel, so the cascaded closes are persisted and forwarded
/// like any other message. Their reaction is suppressed so the cascade
/// cannot feed itself.
struct DeactivateReaction;

#[async_trait::async_trait]
impl ReactionHandler for DeactivateReaction {
    async fn process(
        &self,
        ctx: &NodeContext,
        message: &Message,
        _connection: Option<&Connection>,
        staged: &mut StagedEffects,
    ) -> ProcessingResult<()> {
        staged.participant_state =
            Some((message.receiver_id.clone(), ParticipantState::Inactive));
        for connection in ctx
            .connections
            .open_connections_of(&message.receiver_id)
            .await
        {
            staged.followups.push(Message::close_for_connection(
                &connection,
                ctx.config.new_message_id(),
                &ctx.config.node_id,
            ));
        }
        Ok(())
    }

    async fn react(&self, ctx: &NodeContext, message: &Message) -> ProcessingResult<()> {
        ctx.dispatcher.notify_matcher(ctx, message).await
    }
}

/// ConnectionOpen from a peer: bind the remote side's identifiers on the
/// local connection (write-once; conflicts reject the message at commit
/// staging).
struct RemoteOpenReaction;

#[async_trait::async_trait]
impl ReactionHandler for RemoteOpenReaction {
    async fn process(
        &self,
        _ctx: &NodeContext,
        message: &Message,
        _connection: Option<&Connection>,
        staged: &mut StagedEffects,
    ) -> ProcessingResult<()> {
        staged.remote_participant_id = Some(message.sender_id.clone());
        staged.remote_connection_id = message.sender_connection_id.clone();
        staged.remote_node_id = message.sender_node_id.clone();
        Ok(())
    }
}

/// Hint: drop hints targeting inactive participants.
struct HintReaction;

#[async_trait::async_trait]
impl ReactionHandler for HintReaction {
    async fn process(
        &self,
        ctx: &NodeContext,
        message: &Message,
        _connection: Option<&Connection>,
        staged: &mut StagedEffects,
    ) -> ProcessingResult<()> {
        let participant = ctx
            .participants
            .get(&message.receiver_id)
            .await?
            .ok_or_else(|| ProcessingError::UnknownParticipant(message.receiver_id.clone()))?;
        if !participant.is_active() {
            tracing::debug!(
                message_id = %message.id,
                participant_id = %participant.id,
                "Ignoring hint for inactive participant"
            );
            staged.ignore = true;
        }
        Ok(())
    }
}
