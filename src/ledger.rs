// ============================================================================
// Idempotency & Correlation Ledger
// ============================================================================
//
// One record per message identifier:
// - created the first time an id is seen (the commit-time claim)
// - the response is attached exactly once
// - thereafter only notified-recipient appends
//
// Forwarded copies get fresh ids; an alias record links the copy id back to
// the original so the peer's response (which correlates to the copy id)
// lands on the original's entry.
//
// Concurrency contract: operations on the same id serialize through the
// per-entry mutex; operations on different ids only contend on the brief
// map lock.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::{ProcessingError, ProcessingResult};
use crate::message::Message;
use crate::storage::{keys, Storage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub message: Message,
    pub response: Option<Message>,
    pub notified: Vec<String>,
}

/// Persisted form of a ledger slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LedgerRecord {
    Entry(LedgerEntry),
    Alias(String),
}

#[derive(Clone)]
enum Slot {
    Entry(Arc<Mutex<LedgerEntry>>),
    Alias(String),
}

pub struct Ledger {
    storage: Arc<dyn Storage>,
    slots: RwLock<HashMap<String, Slot>>,
}

impl Ledger {
    pub fn new(storage: Arc<dyn Storage>) -> Ledger {
        Ledger {
            storage,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// First-insert claim for a message id. Returns `false` when the id
    /// already has an entry — the caller is processing a duplicate and must
    /// not commit. An alias slot does not block the claim: a forwarded copy
    /// delivered back to this node (local loopback) is processed under its
    /// own id and takes the slot over.
    pub async fn record_message(&self, message: &Message) -> ProcessingResult<bool> {
        let entry = {
            let mut slots = self.slots.write().await;
            match slots.get(&message.id) {
                Some(Slot::Entry(_)) => return Ok(false),
                Some(Slot::Alias(_)) => {}
                None => {
                    // not hydrated yet; consult storage
                    if let Some(LedgerRecord::Entry(_)) = self.load_record(&message.id).await? {
                        return Ok(false);
                    }
                }
            }
            let entry = Arc::new(Mutex::new(LedgerEntry {
                message: message.clone(),
                response: None,
                notified: Vec::new(),
            }));
            slots.insert(message.id.clone(), Slot::Entry(entry.clone()));
            entry
        };
        let entry = entry.lock().await;
        self.persist(&message.id, &entry).await?;
        Ok(true)
    }

    /// Attach the response for a message id. Resolves aliases, so a response
    /// correlating to a forwarded copy reaches the original entry. Attaching
    /// is one-shot; a second attach with a different response is dropped
    /// with a warning (the entry is immutable after the first).
    pub async fn record_response(&self, id: &str, response: &Message) -> ProcessingResult<()> {
        let Some(entry) = self.resolve(id).await? else {
            warn!(
                correlation_id = %id,
                response_id = %response.id,
                "Response correlates to an unknown message id, dropping"
            );
            return Ok(());
        };
        let mut entry = entry.lock().await;
        if let Some(existing) = &entry.response {
            if existing.id != response.id {
                warn!(
                    correlation_id = %id,
                    response_id = %response.id,
                    existing_response_id = %existing.id,
                    "Entry already has a response, keeping the first"
                );
            }
            return Ok(());
        }
        entry.response = Some(response.clone());
        self.persist(&entry.message.id.clone(), &entry).await
    }

    /// The stored message, response and notified recipients for an id, alias
    /// resolved.
    pub async fn lookup(
        &self,
        id: &str,
    ) -> ProcessingResult<Option<(Message, Option<Message>, Vec<String>)>> {
        match self.resolve(id).await? {
            Some(entry) => {
                let entry = entry.lock().await;
                Ok(Some((
                    entry.message.clone(),
                    entry.response.clone(),
                    entry.notified.clone(),
                )))
            }
            None => Ok(None),
        }
    }

    /// Like `lookup`, but aliases do not resolve. The duplicate check uses
    /// this: an alias only marks an id as linked to an original, it does not
    /// mean the id itself was processed.
    pub async fn lookup_direct(
        &self,
        id: &str,
    ) -> ProcessingResult<Option<(Message, Option<Message>, Vec<String>)>> {
        match self.slot(id).await? {
            Some(Slot::Entry(entry)) => {
                let entry = entry.lock().await;
                Ok(Some((
                    entry.message.clone(),
                    entry.response.clone(),
                    entry.notified.clone(),
                )))
            }
            _ => Ok(None),
        }
    }

    pub async fn mark_notified(&self, id: &str, recipient: &str) -> ProcessingResult<()> {
        let Some(entry) = self.resolve(id).await? else {
            warn!(message_id = %id, recipient = %recipient, "mark_notified on unknown id");
            return Ok(());
        };
        let mut entry = entry.lock().await;
        if entry.notified.iter().any(|r| r == recipient) {
            return Ok(());
        }
        entry.notified.push(recipient.to_string());
        self.persist(&entry.message.id.clone(), &entry).await
    }

    /// Link a forwarded copy's id to the original message id.
    pub async fn record_alias(&self, alias_id: &str, target_id: &str) -> ProcessingResult<()> {
        {
            let mut slots = self.slots.write().await;
            if slots.contains_key(alias_id) {
                return Ok(());
            }
            slots.insert(alias_id.to_string(), Slot::Alias(target_id.to_string()));
        }
        let blob = serde_json::to_vec(&LedgerRecord::Alias(target_id.to_string()))
            .map_err(ProcessingError::storage)?;
        self.storage
            .store(&keys::ledger(alias_id), blob)
            .await
            .map_err(ProcessingError::storage)
    }

    async fn resolve(&self, id: &str) -> ProcessingResult<Option<Arc<Mutex<LedgerEntry>>>> {
        match self.slot(id).await? {
            Some(Slot::Entry(entry)) => Ok(Some(entry)),
            Some(Slot::Alias(target)) => match self.slot(&target).await? {
                Some(Slot::Entry(entry)) => Ok(Some(entry)),
                _ => {
                    // aliases never chain
                    warn!(alias = %id, target = %target, "Dangling ledger alias");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn slot(&self, id: &str) -> ProcessingResult<Option<Slot>> {
        if let Some(slot) = self.slots.read().await.get(id) {
            return Ok(Some(slot.clone()));
        }
        let Some(record) = self.load_record(id).await? else {
            return Ok(None);
        };
        let slot = match record {
            LedgerRecord::Entry(entry) => Slot::Entry(Arc::new(Mutex::new(entry))),
            LedgerRecord::Alias(target) => Slot::Alias(target),
        };
        let mut slots = self.slots.write().await;
        let slot = slots.entry(id.to_string()).or_insert(slot).clone();
        Ok(Some(slot))
    }

    async fn load_record(&self, id: &str) -> ProcessingResult<Option<LedgerRecord>> {
        let Some(blob) = self
            .storage
            .load(&keys::ledger(id))
            .await
            .map_err(ProcessingError::storage)?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&blob)
            .map(Some)
            .map_err(ProcessingError::storage)
    }

    async fn persist(&self, id: &str, entry: &LedgerEntry) -> ProcessingResult<()> {
        let blob = serde_json::to_vec(&LedgerRecord::Entry(entry.clone()))
            .map_err(ProcessingError::storage)?;
        self.storage
            .store(&keys::ledger(id), blob)
            .await
            .map_err(ProcessingError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Direction, MessageType, SuppressFlags};
    use crate::storage::MemoryStorage;
    use chrono::Utc;

    fn message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            message_type: MessageType::ConnectionMessage,
            direction: Direction::FromOwner,
            sender_id: "participant:1".into(),
            sender_connection_id: Some("conn:1".into()),
            sender_node_id: None,
            receiver_id: "participant:2".into(),
            receiver_connection_id: None,
            receiver_node_id: "node:local".into(),
            remote_node_id: None,
            correlation_id: None,
            payload: serde_json::json!({"text": "hi"}),
            timestamp: Utc::now(),
            suppress: SuppressFlags::default(),
            success: None,
        }
    }

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn first_insert_wins() {
        let ledger = ledger();
        assert!(ledger.record_message(&message("msg:1")).await.unwrap());
        assert!(!ledger.record_message(&message("msg:1")).await.unwrap());
    }

    #[tokio::test]
    async fn response_attaches_once() {
        let ledger = ledger();
        ledger.record_message(&message("msg:1")).await.unwrap();
        let first = message("msg:resp-1");
        let second = message("msg:resp-2");
        ledger.record_response("msg:1", &first).await.unwrap();
        ledger.record_response("msg:1", &second).await.unwrap();
        let (_, response, _) = ledger.lookup("msg:1").await.unwrap().unwrap();
        assert_eq!(response.unwrap().id, "msg:resp-1");
    }

    #[tokio::test]
    async fn alias_resolves_to_original_entry() {
        let ledger = ledger();
        ledger.record_message(&message("msg:orig")).await.unwrap();
        ledger.record_alias("msg:fwd", "msg:orig").await.unwrap();
        let response = message("msg:resp");
        ledger.record_response("msg:fwd", &response).await.unwrap();
        let (original, attached, _) = ledger.lookup("msg:orig").await.unwrap().unwrap();
        assert_eq!(original.id, "msg:orig");
        assert_eq!(attached.unwrap().id, "msg:resp");
    }

    #[tokio::test]
    async fn notified_recipients_deduplicate() {
        let ledger = ledger();
        ledger.record_message(&message("msg:1")).await.unwrap();
        ledger.mark_notified("msg:1", "owner-app:a").await.unwrap();
        ledger.mark_notified("msg:1", "owner-app:a").await.unwrap();
        ledger.mark_notified("msg:1", "owner-app:b").await.unwrap();
        let (_, _, notified) = ledger.lookup("msg:1").await.unwrap().unwrap();
        assert_eq!(notified, vec!["owner-app:a", "owner-app:b"]);
    }

    #[tokio::test]
    async fn alias_does_not_block_the_claim_for_its_own_id() {
        let ledger = ledger();
        ledger.record_message(&message("msg:orig")).await.unwrap();
        ledger.record_alias("msg:fwd", "msg:orig").await.unwrap();
        // a looped-back copy is processed under the aliased id
        assert!(ledger.lookup_direct("msg:fwd").await.unwrap().is_none());
        assert!(ledger.record_message(&message("msg:fwd")).await.unwrap());
        assert!(ledger.lookup_direct("msg:fwd").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_correlation_is_tolerated() {
        let ledger = ledger();
        ledger
            .record_response("msg:never-seen", &message("msg:resp"))
            .await
            .unwrap();
        assert!(ledger.lookup("msg:never-seen").await.unwrap().is_none());
    }
}
