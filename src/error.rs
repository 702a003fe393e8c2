use thiserror::Error;

use crate::connection::ConnectionState;
use crate::message::MessageType;

pub type ProcessingResult<T> = Result<T, ProcessingError>;

/// Error taxonomy of the message processing engine.
///
/// Validation-stage errors abort the pipeline before any state mutation and
/// are answered with a failure response to the sender only. `DeliveryFailure`
/// is hop-level and never unwinds a commit. `Storage` is fatal to the current
/// run; redelivery of the inbound message retries it.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message {message_id} is addressed to node {receiver_node}, this node is {local_node}")]
    WrongNode {
        message_id: String,
        receiver_node: String,
        local_node: String,
    },

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    #[error("unauthorized message: {0}")]
    Unauthorized(String),

    #[error("illegal transition on connection {connection_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        connection_id: String,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("message type {message_type:?} is not allowed for connection {connection_id} in state {state:?}")]
    IllegalMessageForState {
        connection_id: String,
        state: ConnectionState,
        message_type: MessageType,
    },

    #[error("delivery to {recipient} failed on hop {hop}: {reason}")]
    DeliveryFailure {
        hop: &'static str,
        recipient: String,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl ProcessingError {
    /// Stable code for log correlation and failure-response payloads.
    pub fn code(&self) -> &'static str {
        match self {
            ProcessingError::MalformedMessage(_) => "MALFORMED_MESSAGE",
            ProcessingError::WrongNode { .. } => "WRONG_NODE",
            ProcessingError::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            ProcessingError::UnknownParticipant(_) => "UNKNOWN_PARTICIPANT",
            ProcessingError::Unauthorized(_) => "UNAUTHORIZED",
            ProcessingError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            ProcessingError::IllegalMessageForState { .. } => "ILLEGAL_MESSAGE_FOR_STATE",
            ProcessingError::DeliveryFailure { .. } => "DELIVERY_FAILURE",
            ProcessingError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// True for errors raised before the commit point. These abort the run
    /// without side effects and produce a failure response to the sender.
    pub fn is_pre_commit(&self) -> bool {
        !matches!(
            self,
            ProcessingError::DeliveryFailure { .. } | ProcessingError::Storage(_)
        )
    }

    /// Log with a severity matching the error class. Validation rejections
    /// are expected operational noise; storage failures are not.
    pub fn log(&self, message_id: &str) {
        match self {
            ProcessingError::Storage(_) => {
                tracing::error!(
                    message_id = %message_id,
                    error = %self,
                    error_code = %self.code(),
                    "Pipeline run failed"
                );
            }
            ProcessingError::DeliveryFailure { hop, recipient, .. } => {
                tracing::warn!(
                    message_id = %message_id,
                    hop = %hop,
                    recipient = %recipient,
                    error = %self,
                    error_code = %self.code(),
                    "Outbound hop failed (commit is not affected)"
                );
            }
            _ => {
                tracing::warn!(
                    message_id = %message_id,
                    error = %self,
                    error_code = %self.code(),
                    "Message rejected"
                );
            }
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        ProcessingError::Storage(err.to_string())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        ProcessingError::MalformedMessage(msg.into())
    }
}
