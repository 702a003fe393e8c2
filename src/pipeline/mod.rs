// ============================================================================
// Routing Pipeline
// ============================================================================
//
// One logical transaction per message:
//
// 1. classify & validate (classifier)
// 2. apply to the state machine (staged, not yet visible)
// 3. run the type-specific reaction handler (staged)
// 4. build the success response
// 5. commit: ledger claim, persist message, persist connection and
//    participant state, attach the response
//
// Nothing before step 5 has visible side effects; an abort discards staged
// work (including a connection created during parent resolution). The
// per-connection lock is held from classification through commit, which
// serializes all messages targeting the same connection.
//
// After commit the routing slip decides which hops run. Each hop has its
// own failure scope: local durability wins over end-to-end atomicity, an
// undelivered forward is surfaced for external redelivery tooling and never
// unwinds the commit.
// ============================================================================

pub mod reactions;
pub mod slip;

use tokio::sync::OwnedMutexGuard;

use crate::classifier::{classify, Classification};
use crate::connection::{transition_for, Connection};
use crate::context::NodeContext;
use crate::error::{ProcessingError, ProcessingResult};
use crate::message::{Message, SuppressFlags};
use crate::storage::keys;
use reactions::StagedEffects;
use slip::{routing_slip, Hop};

/// What one pipeline run did, for workers, logs and tests.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub message_id: String,
    /// The transaction committed.
    pub committed: bool,
    /// The message was a duplicate; the stored response was re-sent.
    pub replayed: bool,
    /// A reaction handler dropped the message without commit (hints).
    pub ignored: bool,
    pub response: Option<Message>,
    /// The connection the message was applied to, if any.
    pub connection_id: Option<String>,
    pub hops_run: Vec<Hop>,
    pub hop_failures: Vec<ProcessingError>,
    /// System messages to feed back through the from-system channel.
    pub followups: Vec<Message>,
}

impl PipelineOutcome {
    fn new(message_id: &str) -> PipelineOutcome {
        PipelineOutcome {
            message_id: message_id.to_string(),
            committed: false,
            replayed: false,
            ignored: false,
            response: None,
            connection_id: None,
            hops_run: Vec::new(),
            hop_failures: Vec::new(),
            followups: Vec::new(),
        }
    }
}

enum TxDone {
    Committed {
        response: Option<Message>,
        followups: Vec<Message>,
        flags: SuppressFlags,
    },
    /// Reaction handler set the ignore flag; abort without commit or error.
    Ignored,
    /// The ledger claim found the id already taken by a concurrent or
    /// earlier run.
    DuplicateInFlight,
}

/// Worker entry point: run the pipeline, enqueue followups, answer
/// validation failures with a failure response to the sender only.
pub async fn handle_inbound(ctx: &NodeContext, message: Message) -> Option<PipelineOutcome> {
    let message_id = message.id.clone();
    match process_message(ctx, &message).await {
        Ok(outcome) => {
            for followup in &outcome.followups {
                if let Err(err) = ctx.senders.from_system.send(followup.clone()).await {
                    tracing::error!(
                        message_id = %followup.id,
                        error = %err,
                        "Failed to enqueue system followup"
                    );
                }
            }
            Some(outcome)
        }
        Err(err) => {
            err.log(&message_id);
            if err.is_pre_commit() && slip::should_respond(&message) {
                let failure = build_failure_response(ctx, &message, &err);
                if let Err(send_err) =
                    ctx.dispatcher.respond_to_sender(ctx, &message, &failure).await
                {
                    send_err.log(&message_id);
                }
            }
            None
        }
    }
}

pub async fn process_message(
    ctx: &NodeContext,
    message: &Message,
) -> ProcessingResult<PipelineOutcome> {
    let validated = match classify(ctx, message.clone()).await? {
        Classification::Replay { response } => {
            let mut outcome = PipelineOutcome::new(&message.id);
            outcome.replayed = true;
            replay_response(ctx, message, response, &mut outcome).await;
            return Ok(outcome);
        }
        Classification::Process(validated) => validated,
    };

    let mut connection = validated.connection;
    let created = validated.created_connection;

    let tx = match stage_and_commit(ctx, message, &mut connection, created).await {
        Ok(tx) => tx,
        Err(err) => {
            release(ctx, connection, created).await;
            return Err(err);
        }
    };

    match tx {
        TxDone::Ignored => {
            release(ctx, connection, created).await;
            let mut outcome = PipelineOutcome::new(&message.id);
            outcome.ignored = true;
            tracing::debug!(message_id = %message.id, "Message ignored by reaction handler");
            Ok(outcome)
        }
        TxDone::DuplicateInFlight => {
            release(ctx, connection, created).await;
            let mut outcome = PipelineOutcome::new(&message.id);
            outcome.replayed = true;
            if let Some((_, Some(response), _)) = ctx.ledger.lookup_direct(&message.id).await? {
                replay_response(ctx, message, response, &mut outcome).await;
            }
            Ok(outcome)
        }
        TxDone::Committed {
            response,
            followups,
            flags,
        } => {
            // connection snapshot for the peer hop, then release the lock
            // before any hop runs
            let snapshot: Option<Connection> = connection.as_deref().cloned();
            drop(connection);

            let mut outcome = PipelineOutcome::new(&message.id);
            outcome.committed = true;
            outcome.response = response;
            outcome.connection_id = snapshot.as_ref().map(|c| c.id.clone());
            outcome.followups = followups;

            for hop in routing_slip(message, outcome.response.as_ref(), flags) {
                let result = match hop {
                    Hop::RespondToSender => match outcome.response.as_ref() {
                        Some(response) => {
                            ctx.dispatcher.respond_to_sender(ctx, message, response).await
                        }
                        None => Ok(()),
                    },
                    Hop::ForwardToPeer => {
                        ctx.dispatcher
                            .forward_to_peer(ctx, message, snapshot.as_ref())
                            .await
                    }
                    Hop::ForwardToOwner => ctx.dispatcher.forward_to_owner(ctx, message).await,
                    Hop::ReactLocally => ctx.reactions.react(ctx, message).await,
                };
                match result {
                    Ok(()) => outcome.hops_run.push(hop),
                    Err(err) => {
                        err.log(&message.id);
                        outcome.hop_failures.push(err);
                    }
                }
            }

            tracing::info!(
                message_id = %message.id,
                message_type = ?message.message_type,
                direction = ?message.direction,
                hops = outcome.hops_run.len(),
                hop_failures = outcome.hop_failures.len(),
                "Message committed"
            );
            Ok(outcome)
        }
    }
}

/// Steps 2–5. Staged effects become visible only if the commit at the end
/// goes through; every non-storage failure happens before the ledger claim.
async fn stage_and_commit(
    ctx: &NodeContext,
    message: &Message,
    connection: &mut Option<OwnedMutexGuard<Connection>>,
    created: bool,
) -> ProcessingResult<TxDone> {
    let mut staged = StagedEffects::default();

    // step 2: the state transition this message would cause. Connections
    // created during parent resolution already carry their initial state.
    if let Some(current) = connection.as_deref() {
        if message.message_type.targets_connection() && !created {
            staged.connection_state = Some(transition_for(
                current,
                message.message_type,
                message.direction,
            )?);
        }
    }

    // step 3: type-specific reaction, staging only
    ctx.reactions
        .process(ctx, message, connection.as_deref(), &mut staged)
        .await?;
    if staged.ignore {
        return Ok(TxDone::Ignored);
    }

    // step 4: the local success response
    let response = if slip::should_respond(message) {
        Some(build_success_response(ctx, message))
    } else {
        None
    };

    // pre-validate the connection mutation so write-once violations and
    // terminal-state guards reject before anything is claimed or persisted
    let next_connection = match connection.as_deref() {
        Some(current) => {
            let mut next = current.clone();
            next.set_remote(
                staged.remote_participant_id.as_deref(),
                staged.remote_connection_id.as_deref(),
                staged.remote_node_id.as_deref(),
            )?;
            if let Some(state) = staged.connection_state {
                next.set_state(state)?;
            }
            Some(next)
        }
        None => None,
    };

    // step 5: commit. The ledger claim is the idempotency gate: exactly one
    // run per message id gets past it.
    if !ctx.ledger.record_message(message).await? {
        return Ok(TxDone::DuplicateInFlight);
    }
    let blob = serde_json::to_vec(message).map_err(ProcessingError::storage)?;
    ctx.storage
        .store(&keys::message(&message.id), blob)
        .await
        .map_err(ProcessingError::storage)?;
    if let Some(next) = next_connection {
        ctx.connections.persist(&next).await?;
        if let Some(current) = connection.as_deref_mut() {
            *current = next;
        }
    }
    if let Some(participant) = staged.participant_upsert.take() {
        ctx.participants.upsert(participant).await?;
    }
    if let Some((participant_id, state)) = staged.participant_state.take() {
        ctx.participants.set_state(&participant_id, state).await?;
    }
    if message.message_type.is_response_message() {
        if let Some(correlation_id) = &message.correlation_id {
            ctx.ledger.record_response(correlation_id, message).await?;
        }
    }
    if let Some(response) = &response {
        ctx.ledger.record_response(&message.id, response).await?;
    }

    Ok(TxDone::Committed {
        response,
        followups: std::mem::take(&mut staged.followups),
        flags: staged.suppress.unwrap_or(message.suppress),
    })
}

async fn replay_response(
    ctx: &NodeContext,
    message: &Message,
    response: Message,
    outcome: &mut PipelineOutcome,
) {
    match ctx.dispatcher.respond_to_sender(ctx, message, &response).await {
        Ok(()) => outcome.hops_run.push(Hop::RespondToSender),
        Err(err) => {
            err.log(&message.id);
            outcome.hop_failures.push(err);
        }
    }
    outcome.response = Some(response);
}

/// Release the connection lock; a connection created by this run that never
/// committed is discarded with it.
async fn release(
    ctx: &NodeContext,
    connection: Option<OwnedMutexGuard<Connection>>,
    created: bool,
) {
    if let Some(guard) = connection {
        let id = guard.id.clone();
        drop(guard);
        if created {
            ctx.connections.discard(&id).await;
        }
    }
}

pub fn build_success_response(ctx: &NodeContext, message: &Message) -> Message {
    Message::response_to(
        message,
        ctx.config.new_message_id(),
        &ctx.config.node_id,
        true,
        serde_json::json!({ "status": "ok" }),
    )
}

pub fn build_failure_response(
    ctx: &NodeContext,
    message: &Message,
    err: &ProcessingError,
) -> Message {
    Message::response_to(
        message,
        ctx.config.new_message_id(),
        &ctx.config.node_id,
        false,
        serde_json::json!({
            "error_code": err.code(),
            "error": err.to_string(),
        }),
    )
}
