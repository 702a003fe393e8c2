// Shared fixtures for the integration tests: an assembled NodeContext over
// in-memory collaborators, a recording outbound transport, and message
// constructors for the common flows.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use accord_node::config::Config;
use accord_node::context::NodeContext;
use accord_node::dispatch::{Dispatcher, OwnerRegistry};
use accord_node::ledger::Ledger;
use accord_node::message::{Direction, Message, MessageType, SuppressFlags};
use accord_node::participant::Participant;
use accord_node::pipeline::reactions::ReactionRegistry;
use accord_node::storage::MemoryStorage;
use accord_node::store::{ConnectionStore, ParticipantStore};
use accord_node::transport::{
    inbound_channels, ChannelReceivers, OutboundTransport, RecipientClass,
};
use accord_node::verifier::AcceptAllVerifier;

pub const NODE: &str = "node:test";
pub const PEER_NODE: &str = "node:remote";

/// Outbound transport that records every send.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(RecipientClass, String, Message)>>,
}

impl RecordingTransport {
    pub async fn sent(&self) -> Vec<(RecipientClass, String, Message)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to_class(&self, class: RecipientClass) -> Vec<(String, Message)> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(c, _, _)| *c == class)
            .map(|(_, recipient, message)| (recipient.clone(), message.clone()))
            .collect()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait::async_trait]
impl OutboundTransport for RecordingTransport {
    async fn send(
        &self,
        class: RecipientClass,
        recipient_id: &str,
        message: &Message,
    ) -> anyhow::Result<()> {
        self.sent
            .lock()
            .await
            .push((class, recipient_id.to_string(), message.clone()));
        Ok(())
    }
}

pub struct TestNode {
    pub ctx: NodeContext,
    pub transport: Arc<RecordingTransport>,
    /// Receive side of the inbound channels; tests drain loopback and
    /// followup traffic from here instead of running consumer pools.
    pub receivers: ChannelReceivers,
}

pub fn test_node() -> TestNode {
    let config = Arc::new(Config::for_node(NODE));
    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(RecordingTransport::default());
    let outbound: Arc<dyn OutboundTransport> = transport.clone();
    let (senders, receivers) = inbound_channels(64);

    let ctx = NodeContext {
        connections: Arc::new(ConnectionStore::new(storage.clone())),
        participants: Arc::new(ParticipantStore::new(storage.clone())),
        ledger: Arc::new(Ledger::new(storage.clone())),
        dispatcher: Arc::new(Dispatcher::new(outbound, Duration::from_secs(1))),
        reactions: Arc::new(ReactionRegistry::standard()),
        owners: Arc::new(OwnerRegistry::new()),
        verifier: Arc::new(AcceptAllVerifier),
        senders,
        storage,
        config,
    };
    TestNode {
        ctx,
        transport,
        receivers,
    }
}

/// Register a participant with its owner application and listeners.
pub async fn seed_participant(node: &TestNode, id: &str, owner_app: &str, listeners: &[&str]) {
    node.ctx
        .participants
        .upsert(Participant::new(id.to_string(), owner_app.to_string()))
        .await
        .unwrap();
    for listener in listeners {
        node.ctx.owners.register_listener(owner_app, listener).await;
    }
}

pub fn base_message(id: &str, message_type: MessageType, direction: Direction) -> Message {
    Message {
        id: id.to_string(),
        message_type,
        direction,
        sender_id: String::new(),
        sender_connection_id: None,
        sender_node_id: None,
        receiver_id: String::new(),
        receiver_connection_id: None,
        receiver_node_id: NODE.to_string(),
        remote_node_id: None,
        correlation_id: None,
        payload: serde_json::json!({}),
        timestamp: Utc::now(),
        suppress: SuppressFlags::default(),
        success: None,
    }
}

/// Owner opens a fresh connection toward a participant on `remote_node`.
pub fn owner_open(id: &str, sender: &str, receiver: &str, remote_node: &str) -> Message {
    let mut msg = base_message(id, MessageType::ConnectionOpen, Direction::FromOwner);
    msg.sender_id = sender.to_string();
    msg.receiver_id = receiver.to_string();
    msg.remote_node_id = Some(remote_node.to_string());
    msg
}

/// Owner accepts / promotes an existing connection.
pub fn owner_open_on(id: &str, sender: &str, receiver: &str, connection_id: &str) -> Message {
    let mut msg = base_message(id, MessageType::ConnectionOpen, Direction::FromOwner);
    msg.sender_id = sender.to_string();
    msg.receiver_id = receiver.to_string();
    msg.sender_connection_id = Some(connection_id.to_string());
    msg
}

/// A peer node opens a connection toward a local participant.
pub fn peer_open(
    id: &str,
    sender: &str,
    sender_connection: &str,
    sender_node: &str,
    receiver: &str,
) -> Message {
    let mut msg = base_message(id, MessageType::ConnectionOpen, Direction::FromPeer);
    msg.sender_id = sender.to_string();
    msg.sender_connection_id = Some(sender_connection.to_string());
    msg.sender_node_id = Some(sender_node.to_string());
    msg.receiver_id = receiver.to_string();
    msg
}

/// A peer accepts on an existing local connection.
pub fn peer_open_on(
    id: &str,
    sender: &str,
    sender_connection: &str,
    sender_node: &str,
    receiver: &str,
    receiver_connection: &str,
) -> Message {
    let mut msg = peer_open(id, sender, sender_connection, sender_node, receiver);
    msg.receiver_connection_id = Some(receiver_connection.to_string());
    msg
}

pub fn owner_chat(id: &str, sender: &str, receiver: &str, connection_id: &str) -> Message {
    let mut msg = base_message(id, MessageType::ConnectionMessage, Direction::FromOwner);
    msg.sender_id = sender.to_string();
    msg.receiver_id = receiver.to_string();
    msg.sender_connection_id = Some(connection_id.to_string());
    msg.payload = serde_json::json!({"text": "hello"});
    msg
}

pub fn owner_close(id: &str, sender: &str, receiver: &str, connection_id: &str) -> Message {
    let mut msg = base_message(id, MessageType::ConnectionClose, Direction::FromOwner);
    msg.sender_id = sender.to_string();
    msg.receiver_id = receiver.to_string();
    msg.sender_connection_id = Some(connection_id.to_string());
    msg
}

pub fn create_participant(id: &str, participant: &str, owner_app: &str) -> Message {
    let mut msg = base_message(id, MessageType::CreateParticipant, Direction::FromOwner);
    msg.sender_id = participant.to_string();
    msg.receiver_id = participant.to_string();
    msg.payload = serde_json::json!({"owner_app": owner_app});
    msg
}

pub fn deactivate(id: &str, participant: &str) -> Message {
    let mut msg = base_message(id, MessageType::Deactivate, Direction::FromOwner);
    msg.sender_id = participant.to_string();
    msg.receiver_id = participant.to_string();
    msg
}

pub fn hint(id: &str, receiver: &str, counterpart: &str, counterpart_node: &str) -> Message {
    let mut msg = base_message(id, MessageType::Hint, Direction::FromMatcher);
    msg.sender_id = "matcher:main".to_string();
    msg.receiver_id = receiver.to_string();
    msg.remote_node_id = Some(counterpart_node.to_string());
    msg.payload = serde_json::json!({"counterpart_id": counterpart, "score": 0.87});
    msg
}
