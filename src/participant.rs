use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantState {
    Active,
    Inactive,
}

/// A registered entity capable of holding connections. Participants are
/// never physically deleted while connections reference them; deactivation
/// is a soft state change that cascades a close to every open connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    /// Owning application; outbound copies fan out to its registered
    /// listeners.
    pub owner_app_id: String,
    pub state: ParticipantState,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(id: String, owner_app_id: String) -> Participant {
        Participant {
            id,
            owner_app_id,
            state: ParticipantState::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ParticipantState::Active
    }
}
