use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::connection::Connection;
use crate::error::{ProcessingError, ProcessingResult};
use crate::participant::{Participant, ParticipantState};
use crate::storage::{keys, Storage};

/// In-process connection registry. Each connection sits behind its own
/// `Mutex`; holding the guard from parent resolution through commit is what
/// serializes messages targeting the same connection. Durable snapshots go
/// through the storage collaborator; the live map hydrates from storage on
/// miss so a restarted node picks its connections back up lazily.
pub struct ConnectionStore {
    storage: Arc<dyn Storage>,
    live: RwLock<HashMap<String, Arc<Mutex<Connection>>>>,
}

impl ConnectionStore {
    pub fn new(storage: Arc<dyn Storage>) -> ConnectionStore {
        ConnectionStore {
            storage,
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly created connection and lock it for update. The
    /// connection is not persisted yet; it becomes durable at commit, or is
    /// discarded on abort.
    pub async fn create(&self, connection: Connection) -> ProcessingResult<OwnedMutexGuard<Connection>> {
        let id = connection.id.clone();
        let slot = Arc::new(Mutex::new(connection));
        {
            let mut live = self.live.write().await;
            if live.contains_key(&id) {
                return Err(ProcessingError::storage(format!(
                    "connection id collision: {id}"
                )));
            }
            live.insert(id, slot.clone());
        }
        Ok(slot.lock_owned().await)
    }

    /// Resolve an existing connection and acquire its update lock. Returns
    /// `None` if the connection is unknown to this node.
    pub async fn lock_for_update(
        &self,
        id: &str,
    ) -> ProcessingResult<Option<OwnedMutexGuard<Connection>>> {
        if let Some(slot) = self.slot(id).await? {
            return Ok(Some(slot.lock_owned().await));
        }
        Ok(None)
    }

    pub async fn snapshot(&self, id: &str) -> ProcessingResult<Option<Connection>> {
        match self.slot(id).await? {
            Some(slot) => Ok(Some(slot.lock().await.clone())),
            None => Ok(None),
        }
    }

    /// Persist the current state of a connection. Called at commit while the
    /// update lock is held.
    pub async fn persist(&self, connection: &Connection) -> ProcessingResult<()> {
        let blob = serde_json::to_vec(connection).map_err(ProcessingError::storage)?;
        self.storage
            .store(&keys::connection(&connection.id), blob)
            .await
            .map_err(ProcessingError::storage)
    }

    /// Drop a connection that was created during classification but whose
    /// pipeline run aborted before commit. Never called on persisted
    /// connections.
    pub async fn discard(&self, id: &str) {
        self.live.write().await.remove(id);
    }

    /// Snapshots of all non-closed connections owned by a participant, for
    /// the deactivation cascade.
    pub async fn open_connections_of(&self, participant_id: &str) -> Vec<Connection> {
        let slots: Vec<Arc<Mutex<Connection>>> =
            self.live.read().await.values().cloned().collect();
        let mut open = Vec::new();
        for slot in slots {
            let connection = slot.lock().await;
            if connection.participant_id == participant_id && connection.closes_on_deactivate() {
                open.push(connection.clone());
            }
        }
        open
    }

    async fn slot(&self, id: &str) -> ProcessingResult<Option<Arc<Mutex<Connection>>>> {
        if let Some(slot) = self.live.read().await.get(id) {
            return Ok(Some(slot.clone()));
        }
        // live miss: hydrate from storage
        let Some(blob) = self
            .storage
            .load(&keys::connection(id))
            .await
            .map_err(ProcessingError::storage)?
        else {
            return Ok(None);
        };
        let connection: Connection =
            serde_json::from_slice(&blob).map_err(ProcessingError::storage)?;
        let mut live = self.live.write().await;
        let slot = live
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(connection)))
            .clone();
        Ok(Some(slot))
    }
}

/// Participant registry. Mutations are rare (create / activate / deactivate)
/// and go through the map's write lock; reads clone.
pub struct ParticipantStore {
    storage: Arc<dyn Storage>,
    live: RwLock<HashMap<String, Participant>>,
}

impl ParticipantStore {
    pub fn new(storage: Arc<dyn Storage>) -> ParticipantStore {
        ParticipantStore {
            storage,
            live: RwLock::new(HashMap::new()),
        }
    }

    pub async fn upsert(&self, participant: Participant) -> ProcessingResult<()> {
        self.persist(&participant).await?;
        self.live
            .write()
            .await
            .insert(participant.id.clone(), participant);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> ProcessingResult<Option<Participant>> {
        if let Some(participant) = self.live.read().await.get(id) {
            return Ok(Some(participant.clone()));
        }
        let Some(blob) = self
            .storage
            .load(&keys::participant(id))
            .await
            .map_err(ProcessingError::storage)?
        else {
            return Ok(None);
        };
        let participant: Participant =
            serde_json::from_slice(&blob).map_err(ProcessingError::storage)?;
        self.live
            .write()
            .await
            .entry(id.to_string())
            .or_insert_with(|| participant.clone());
        Ok(Some(participant))
    }

    pub async fn exists(&self, id: &str) -> ProcessingResult<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Soft lifecycle change; participants are never removed.
    pub async fn set_state(
        &self,
        id: &str,
        state: ParticipantState,
    ) -> ProcessingResult<Participant> {
        let mut participant = self
            .get(id)
            .await?
            .ok_or_else(|| ProcessingError::UnknownParticipant(id.to_string()))?;
        participant.state = state;
        self.persist(&participant).await?;
        self.live
            .write()
            .await
            .insert(participant.id.clone(), participant.clone());
        Ok(participant)
    }

    async fn persist(&self, participant: &Participant) -> ProcessingResult<()> {
        let blob = serde_json::to_vec(participant).map_err(ProcessingError::storage)?;
        self.storage
            .store(&keys::participant(&participant.id), blob)
            .await
            .map_err(ProcessingError::storage)
    }
}
