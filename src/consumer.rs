// ============================================================================
// Inbound Consumers
// ============================================================================
//
// A bounded pool of worker tasks per inbound channel. Each message is
// processed end-to-end by a single worker; workers share nothing per-message
// and only meet at the ledger and the stores. Shutdown is cooperative: the
// watch signal stops workers from taking new messages, in-flight pipeline
// runs finish.
// ============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::context::NodeContext;
use crate::message::Message;
use crate::pipeline::handle_inbound;
use crate::transport::Channel;

pub fn spawn_consumers(
    ctx: &NodeContext,
    channel: Channel,
    receiver: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    let count = ctx.config.worker.consumers_per_channel.max(1);
    (0..count)
        .map(|worker| {
            let ctx = ctx.clone();
            let receiver = receiver.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::debug!(channel = channel.name(), worker, "Consumer started");
                loop {
                    // take the next message or stop; the receiver lock is
                    // only held while waiting, never during processing
                    let message = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => None,
                            message = receiver.recv() => message,
                        }
                    };
                    let Some(mut message) = message else { break };

                    // the channel tags the direction
                    message.direction = channel.direction();
                    if channel == Channel::FromSystem {
                        prepare_system_message(&ctx, &mut message);
                    }
                    handle_inbound(&ctx, message).await;
                }
                tracing::debug!(channel = channel.name(), worker, "Consumer stopped");
            })
        })
        .collect()
}

/// System-generated messages get an id and a fresh timestamp before they
/// enter the normal processing path.
fn prepare_system_message(ctx: &NodeContext, message: &mut Message) {
    if message.id.is_empty() {
        message.id = ctx.config.new_message_id();
    }
    message.timestamp = Utc::now();
}
