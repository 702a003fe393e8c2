use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::RwLock;

/// Keyed blob storage collaborator. The engine needs nothing beyond
/// store/load/exists; a real deployment plugs in its document store here.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn store(&self, id: &str, blob: Vec<u8>) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>>;
    async fn exists(&self, id: &str) -> Result<bool>;
}

/// In-memory reference implementation, used by the default assembly and the
/// test suite.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, id: &str, blob: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(id.to_string(), blob);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(id).cloned())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(id))
    }
}

/// Storage key prefixes, one namespace per record kind.
pub mod keys {
    pub fn message(id: &str) -> String {
        format!("msg:{id}")
    }

    pub fn connection(id: &str) -> String {
        format!("conn:{id}")
    }

    pub fn participant(id: &str) -> String {
        format!("participant:{id}")
    }

    pub fn ledger(id: &str) -> String {
        format!("ledger:{id}")
    }
}
