// ============================================================================
// Outbound Dispatcher
// ============================================================================
//
// Resolves a hop to concrete recipients and places one outbound copy per
// recipient. Delivery is fire-and-forget for the pipeline: every send is
// bounded by a timeout and a failure surfaces as DeliveryFailure without
// touching the already-committed state. Retry toward the downstream
// transport is the transport's own concern (at-least-once assumed).
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::classifier::owner_app_of;
use crate::connection::Connection;
use crate::context::NodeContext;
use crate::error::{ProcessingError, ProcessingResult};
use crate::message::Message;
use crate::transport::{OutboundTransport, RecipientClass};

/// Listener endpoints per owner application. An owner application may have
/// several registered listeners; each receives its own copy.
#[derive(Default)]
pub struct OwnerRegistry {
    listeners: RwLock<HashMap<String, Vec<String>>>,
}

impl OwnerRegistry {
    pub fn new() -> OwnerRegistry {
        OwnerRegistry::default()
    }

    pub async fn register_listener(&self, owner_app_id: &str, listener_id: &str) {
        let mut listeners = self.listeners.write().await;
        let entries = listeners.entry(owner_app_id.to_string()).or_default();
        if !entries.iter().any(|l| l == listener_id) {
            entries.push(listener_id.to_string());
        }
    }

    pub async fn listeners_for(&self, owner_app_id: &str) -> Vec<String> {
        self.listeners
            .read()
            .await
            .get(owner_app_id)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct Dispatcher {
    transport: Arc<dyn OutboundTransport>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn OutboundTransport>, send_timeout: Duration) -> Dispatcher {
        Dispatcher {
            transport,
            send_timeout,
        }
    }

    /// Route a response back to whoever sent the original message: the owner
    /// application's listeners for local messages, the originating node for
    /// remote ones. Best effort; validation failures never propagate further
    /// than the sender.
    pub async fn respond_to_sender(
        &self,
        ctx: &NodeContext,
        original: &Message,
        response: &Message,
    ) -> ProcessingResult<()> {
        if original.direction.is_remote() {
            let node = original.sender_node_id.as_deref().unwrap_or_default();
            if node.is_empty() {
                tracing::debug!(
                    message_id = %original.id,
                    "No sender node on remote message, dropping response"
                );
                return Ok(());
            }
            if node == ctx.config.node_id {
                // answering a looped-back copy: stay in-process
                return ctx.senders.from_peer.send(response.clone()).await.map_err(|e| {
                    ProcessingError::DeliveryFailure {
                        hop: "respond-to-sender",
                        recipient: node.to_string(),
                        reason: format!("loopback channel closed: {e}"),
                    }
                });
            }
            return self
                .send("respond-to-sender", RecipientClass::PeerNode, node, response)
                .await;
        }

        let Some(owner_app) = self.owner_app_for(ctx, original).await? else {
            tracing::debug!(
                message_id = %original.id,
                sender_id = %original.sender_id,
                "No owner application resolvable for sender, dropping response"
            );
            return Ok(());
        };
        let listeners = ctx.owners.listeners_for(&owner_app).await;
        if listeners.is_empty() {
            tracing::debug!(
                message_id = %original.id,
                owner_app = %owner_app,
                "Owner application has no registered listeners"
            );
            return Ok(());
        }
        for listener in listeners {
            self.send(
                "respond-to-sender",
                RecipientClass::OwnerApplication,
                &listener,
                response,
            )
            .await?;
        }
        Ok(())
    }

    /// Forward a committed message to the remote side of its connection. The
    /// copy gets a fresh id, linked to the original in the ledger so the
    /// peer's response correlates. A copy addressed to this node itself is
    /// looped back onto the from-peer channel instead of leaving the
    /// process.
    pub async fn forward_to_peer(
        &self,
        ctx: &NodeContext,
        message: &Message,
        connection: Option<&Connection>,
    ) -> ProcessingResult<()> {
        let Some(connection) = connection else {
            tracing::debug!(message_id = %message.id, "No connection snapshot, skipping peer hop");
            return Ok(());
        };
        let Some(remote_node) = connection.remote_node_id.clone() else {
            // purely local connection
            tracing::debug!(
                message_id = %message.id,
                connection_id = %connection.id,
                "Connection has no remote node, skipping peer hop"
            );
            return Ok(());
        };

        let forward = Message::forward_for_peer(
            message,
            connection,
            ctx.config.new_message_id(),
            &remote_node,
        );
        ctx.ledger.record_alias(&forward.id, &message.id).await?;

        if remote_node == ctx.config.node_id {
            // the counterpart lives on this node: loop back instead of
            // going through the outbound transport
            ctx.senders
                .from_peer
                .send(forward)
                .await
                .map_err(|e| ProcessingError::DeliveryFailure {
                    hop: "forward-to-peer",
                    recipient: remote_node.clone(),
                    reason: format!("loopback channel closed: {e}"),
                })?;
        } else {
            self.send(
                "forward-to-peer",
                RecipientClass::PeerNode,
                &remote_node,
                &forward,
            )
            .await?;
        }
        ctx.ledger
            .mark_notified(&message.id, &format!("peer-node:{remote_node}"))
            .await?;
        Ok(())
    }

    /// Fan a committed remote-origin message out to the local participant's
    /// owner listeners, one copy each.
    pub async fn forward_to_owner(
        &self,
        ctx: &NodeContext,
        message: &Message,
    ) -> ProcessingResult<()> {
        let participant_id = message.local_participant_id();
        let Some(participant) = ctx.participants.get(participant_id).await? else {
            tracing::debug!(
                message_id = %message.id,
                participant_id = %participant_id,
                "Participant unknown, skipping owner hop"
            );
            return Ok(());
        };
        let listeners = ctx.owners.listeners_for(&participant.owner_app_id).await;
        if listeners.is_empty() {
            tracing::debug!(
                message_id = %message.id,
                owner_app = %participant.owner_app_id,
                "Owner application has no registered listeners"
            );
            return Ok(());
        }
        for listener in listeners {
            self.send(
                "forward-to-owner",
                RecipientClass::OwnerApplication,
                &listener,
                message,
            )
            .await?;
            ctx.ledger
                .mark_notified(&message.id, &format!("owner-application:{listener}"))
                .await?;
        }
        Ok(())
    }

    /// Participant lifecycle notification toward the matcher service.
    pub async fn notify_matcher(
        &self,
        ctx: &NodeContext,
        message: &Message,
    ) -> ProcessingResult<()> {
        self.send(
            "notify-matcher",
            RecipientClass::Matcher,
            &ctx.config.matcher_id,
            message,
        )
        .await
    }

    async fn send(
        &self,
        hop: &'static str,
        class: RecipientClass,
        recipient: &str,
        message: &Message,
    ) -> ProcessingResult<()> {
        match tokio::time::timeout(self.send_timeout, self.transport.send(class, recipient, message))
            .await
        {
            Ok(Ok(())) => {
                tracing::debug!(
                    hop = %hop,
                    recipient_class = class.as_str(),
                    recipient = %recipient,
                    message_id = %message.id,
                    "Outbound copy placed"
                );
                Ok(())
            }
            Ok(Err(err)) => Err(ProcessingError::DeliveryFailure {
                hop,
                recipient: recipient.to_string(),
                reason: err.to_string(),
            }),
            Err(_) => Err(ProcessingError::DeliveryFailure {
                hop,
                recipient: recipient.to_string(),
                reason: format!("timed out after {:?}", self.send_timeout),
            }),
        }
    }

    /// Owner application of the message's sender: from the participant
    /// record when it exists, falling back to the payload for
    /// CreateParticipant failures (the participant may not exist yet).
    async fn owner_app_for(
        &self,
        ctx: &NodeContext,
        message: &Message,
    ) -> ProcessingResult<Option<String>> {
        if let Some(participant) = ctx.participants.get(&message.sender_id).await? {
            return Ok(Some(participant.owner_app_id));
        }
        Ok(owner_app_of(message))
    }
}
