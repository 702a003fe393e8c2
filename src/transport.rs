use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::message::{Direction, Message};

/// Downstream party classes the dispatcher can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecipientClass {
    OwnerApplication,
    PeerNode,
    Matcher,
}

impl RecipientClass {
    pub fn as_str(self) -> &'static str {
        match self {
            RecipientClass::OwnerApplication => "owner-application",
            RecipientClass::PeerNode => "peer-node",
            RecipientClass::Matcher => "matcher",
        }
    }
}

/// Outbound send primitive. Delivery is fire-and-forget from the pipeline's
/// perspective; retry/backoff toward the downstream transport is the
/// implementation's concern (at-least-once is assumed).
#[async_trait::async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send(
        &self,
        class: RecipientClass,
        recipient_id: &str,
        message: &Message,
    ) -> Result<()>;
}

/// The four logical inbound channels. Each tags consumed messages with its
/// direction before they enter the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    FromOwner,
    FromPeer,
    FromMatcher,
    FromSystem,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::FromOwner,
        Channel::FromPeer,
        Channel::FromMatcher,
        Channel::FromSystem,
    ];

    pub fn direction(self) -> Direction {
        match self {
            Channel::FromOwner => Direction::FromOwner,
            Channel::FromPeer => Direction::FromPeer,
            Channel::FromMatcher => Direction::FromMatcher,
            Channel::FromSystem => Direction::FromSystem,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::FromOwner => "from-owner",
            Channel::FromPeer => "from-peer",
            Channel::FromMatcher => "from-matcher",
            Channel::FromSystem => "from-system",
        }
    }
}

/// Send side of the inbound channels, handed to transport adapters and used
/// internally for loopback (local peer delivery) and system followups.
#[derive(Clone)]
pub struct ChannelSenders {
    pub from_owner: mpsc::Sender<Message>,
    pub from_peer: mpsc::Sender<Message>,
    pub from_matcher: mpsc::Sender<Message>,
    pub from_system: mpsc::Sender<Message>,
}

impl ChannelSenders {
    pub fn for_channel(&self, channel: Channel) -> &mpsc::Sender<Message> {
        match channel {
            Channel::FromOwner => &self.from_owner,
            Channel::FromPeer => &self.from_peer,
            Channel::FromMatcher => &self.from_matcher,
            Channel::FromSystem => &self.from_system,
        }
    }
}

/// Receive side, consumed by the worker pools.
pub struct ChannelReceivers {
    pub from_owner: mpsc::Receiver<Message>,
    pub from_peer: mpsc::Receiver<Message>,
    pub from_matcher: mpsc::Receiver<Message>,
    pub from_system: mpsc::Receiver<Message>,
}

pub fn inbound_channels(capacity: usize) -> (ChannelSenders, ChannelReceivers) {
    let (owner_tx, owner_rx) = mpsc::channel(capacity);
    let (peer_tx, peer_rx) = mpsc::channel(capacity);
    let (matcher_tx, matcher_rx) = mpsc::channel(capacity);
    let (system_tx, system_rx) = mpsc::channel(capacity);
    (
        ChannelSenders {
            from_owner: owner_tx,
            from_peer: peer_tx,
            from_matcher: matcher_tx,
            from_system: system_tx,
        },
        ChannelReceivers {
            from_owner: owner_rx,
            from_peer: peer_rx,
            from_matcher: matcher_rx,
            from_system: system_rx,
        },
    )
}

/// Outbound transport that only logs. Used by the standalone assembly when
/// no real transport is wired up.
pub struct LoggingTransport;

#[async_trait::async_trait]
impl OutboundTransport for LoggingTransport {
    async fn send(
        &self,
        class: RecipientClass,
        recipient_id: &str,
        message: &Message,
    ) -> Result<()> {
        tracing::info!(
            recipient_class = class.as_str(),
            recipient = %recipient_id,
            message_id = %message.id,
            message_type = ?message.message_type,
            "Outbound message (logging transport)"
        );
        Ok(())
    }
}
