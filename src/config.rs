use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

// Default worker pool sizing. Five consumers per inbound channel matches the
// load profile the engine was tuned against; override via environment.
const DEFAULT_CONSUMERS_PER_CHANNEL: usize = 5;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// Default outbound delivery acknowledgment timeout (milliseconds).
const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

const DEFAULT_NODE_ID: &str = "node:local";
const DEFAULT_MATCHER_ID: &str = "matcher:main";

/// Inbound consumer pool configuration.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Concurrent consumers per inbound channel.
    pub consumers_per_channel: usize,
    /// Bounded capacity of each inbound channel.
    pub channel_capacity: usize,
}

/// Outbound delivery configuration.
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// Timeout for a single outbound send before the hop is marked failed.
    pub send_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Identity of this node; the addressing check rejects messages whose
    /// receiver node differs.
    pub node_id: String,
    /// Matcher service that receives participant lifecycle notifications.
    pub matcher_id: String,
    pub rust_log: String,
    pub worker: WorkerConfig,
    pub delivery: DeliveryConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            node_id: std::env::var("ACCORD_NODE_ID")
                .unwrap_or_else(|_| DEFAULT_NODE_ID.to_string()),
            matcher_id: std::env::var("ACCORD_MATCHER_ID")
                .unwrap_or_else(|_| DEFAULT_MATCHER_ID.to_string()),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            worker: WorkerConfig {
                consumers_per_channel: std::env::var("ACCORD_CONSUMERS_PER_CHANNEL")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_CONSUMERS_PER_CHANNEL),
                channel_capacity: std::env::var("ACCORD_CHANNEL_CAPACITY")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            },
            delivery: DeliveryConfig {
                send_timeout_ms: std::env::var("ACCORD_SEND_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_SEND_TIMEOUT_MS),
            },
        })
    }

    /// Configuration with defaults for a given node identity. Used by tests
    /// and embedded assemblies that do not read the environment.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            matcher_id: DEFAULT_MATCHER_ID.to_string(),
            rust_log: "info".to_string(),
            worker: WorkerConfig {
                consumers_per_channel: DEFAULT_CONSUMERS_PER_CHANNEL,
                channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            },
            delivery: DeliveryConfig {
                send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            },
        }
    }

    pub fn new_message_id(&self) -> String {
        format!("{}/msg/{}", self.node_id, Uuid::new_v4())
    }

    pub fn new_connection_id(&self) -> String {
        format!("{}/conn/{}", self.node_id, Uuid::new_v4())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.send_timeout_ms)
    }
}
