use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::{Dispatcher, OwnerRegistry};
use crate::ledger::Ledger;
use crate::pipeline::reactions::ReactionRegistry;
use crate::store::{ConnectionStore, ParticipantStore};
use crate::storage::Storage;
use crate::transport::ChannelSenders;
use crate::verifier::Verifier;

/// Shared services of one node, passed explicitly into every pipeline step.
/// The ledger and the stores are the only cross-worker mutable state; both
/// carry their own lock discipline.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Arc<Config>,
    pub storage: Arc<dyn Storage>,
    pub connections: Arc<ConnectionStore>,
    pub participants: Arc<ParticipantStore>,
    pub ledger: Arc<Ledger>,
    pub verifier: Arc<dyn Verifier>,
    pub reactions: Arc<ReactionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub owners: Arc<OwnerRegistry>,
    /// Inbound senders, used for local peer loopback and system followups.
    pub senders: ChannelSenders,
}
