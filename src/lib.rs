use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod classifier;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod message;
pub mod participant;
pub mod pipeline;
pub mod storage;
pub mod store;
pub mod transport;
pub mod verifier;

use config::Config;
use consumer::spawn_consumers;
use context::NodeContext;
use dispatch::{Dispatcher, OwnerRegistry};
use ledger::Ledger;
use pipeline::reactions::ReactionRegistry;
use storage::{MemoryStorage, Storage};
use store::{ConnectionStore, ParticipantStore};
use transport::{
    inbound_channels, Channel, ChannelSenders, LoggingTransport, OutboundTransport,
};
use verifier::{AcceptAllVerifier, Verifier};

/// A running node: consumer pools over the four inbound channels, wired to
/// the shared service context.
pub struct Node {
    pub context: NodeContext,
    pub senders: ChannelSenders,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Node {
    /// Assemble the engine and spawn the consumer pools. Must run inside a
    /// tokio runtime.
    pub fn start(
        config: Config,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn OutboundTransport>,
        verifier: Arc<dyn Verifier>,
    ) -> Node {
        let config = Arc::new(config);
        let (senders, receivers) = inbound_channels(config.worker.channel_capacity);

        let context = NodeContext {
            connections: Arc::new(ConnectionStore::new(storage.clone())),
            participants: Arc::new(ParticipantStore::new(storage.clone())),
            ledger: Arc::new(Ledger::new(storage.clone())),
            dispatcher: Arc::new(Dispatcher::new(transport, config.send_timeout())),
            reactions: Arc::new(ReactionRegistry::standard()),
            owners: Arc::new(OwnerRegistry::new()),
            senders: senders.clone(),
            storage,
            verifier,
            config,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();
        workers.extend(spawn_consumers(
            &context,
            Channel::FromOwner,
            receivers.from_owner,
            shutdown_rx.clone(),
        ));
        workers.extend(spawn_consumers(
            &context,
            Channel::FromPeer,
            receivers.from_peer,
            shutdown_rx.clone(),
        ));
        workers.extend(spawn_consumers(
            &context,
            Channel::FromMatcher,
            receivers.from_matcher,
            shutdown_rx.clone(),
        ));
        workers.extend(spawn_consumers(
            &context,
            Channel::FromSystem,
            receivers.from_system,
            shutdown_rx,
        ));

        tracing::info!(
            node_id = %context.config.node_id,
            consumers_per_channel = context.config.worker.consumers_per_channel,
            "Node started"
        );

        Node {
            senders,
            context,
            shutdown_tx,
            workers,
        }
    }

    /// Stop taking new messages and wait for in-flight work to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Standalone assembly: in-memory storage, logging outbound transport,
/// accept-all verifier. Runs until ctrl-c.
pub async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let node = Node::start(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(LoggingTransport),
        Arc::new(AcceptAllVerifier),
    );

    signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received. Draining consumers...");
    node.shutdown().await;

    Ok(())
}
