//! Human-in-the-loop approval for mutating operations.
//!
//! ```text
//! Idle --confirmation_required--> AwaitingConfirmation
//! AwaitingConfirmation --resolve(false)--> Idle
//! AwaitingConfirmation --resolve(true)--> Executing
//! Executing --done--> Idle
//! Executing --confirmation_required--> AwaitingConfirmation
//! ```
//!
//! Each hop into `AwaitingConfirmation` deepens the chain; a chain deeper
//! than the configured limit is treated as a misbehaving backend.

use crate::error::ProtocolError;
use crate::protocol::{ConfirmRequest, ConfirmationPayload};
use std::fmt;
use tracing::{debug, warn};

pub const DEFAULT_MAX_CONFIRMATION_ROUNDS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Read,
    Other(String),
}

impl OperationKind {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREATE" | "INSERT" => OperationKind::Create,
            "UPDATE" => OperationKind::Update,
            "DELETE" => OperationKind::Delete,
            "READ" | "SELECT" => OperationKind::Read,
            _ => OperationKind::Other(value.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
            OperationKind::Read => "READ",
            OperationKind::Other(value) => value,
        }
    }

    pub fn past_tense(&self) -> Option<&'static str> {
        match self {
            OperationKind::Create => Some("created"),
            OperationKind::Update => Some("updated"),
            OperationKind::Delete => Some("deleted"),
            OperationKind::Read | OperationKind::Other(_) => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutating operation the backend wants approved before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub operation: OperationKind,
    pub sql: String,
    pub explanation: String,
    pub model: String,
}

impl PendingOperation {
    pub fn from_payload(payload: &ConfirmationPayload, model: &str) -> Self {
        let explanation = if payload.message.trim().is_empty() {
            format!("{} operation", payload.operation.trim())
        } else {
            payload.message.clone()
        };
        Self {
            operation: OperationKind::parse(&payload.operation),
            sql: payload.sql.clone(),
            explanation,
            model: model.to_string(),
        }
    }

    pub fn confirm_request(&self, conversation_id: i64, confirmed: bool) -> ConfirmRequest {
        ConfirmRequest {
            conversation_id,
            operation: self.operation.as_str().to_string(),
            sql_query: self.sql.clone(),
            explanation: self.explanation.clone(),
            confirmed,
            model: self.model.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfirmationState {
    #[default]
    Idle,
    AwaitingConfirmation(PendingOperation),
    Executing(PendingOperation),
}

/// The caller's decision, carrying the operation it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Execute(PendingOperation),
    Reject(PendingOperation),
}

#[derive(Debug, Clone)]
pub struct ConfirmationCoordinator {
    state: ConfirmationState,
    depth: u32,
    max_depth: u32,
}

impl Default for ConfirmationCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONFIRMATION_ROUNDS)
    }
}

impl ConfirmationCoordinator {
    pub fn new(max_depth: u32) -> Self {
        Self {
            state: ConfirmationState::Idle,
            depth: 0,
            max_depth: max_depth.max(1),
        }
    }

    pub fn state(&self) -> &ConfirmationState {
        &self.state
    }

    /// The operation awaiting a decision or being carried out.
    pub fn pending(&self) -> Option<&PendingOperation> {
        match &self.state {
            ConfirmationState::AwaitingConfirmation(op) | ConfirmationState::Executing(op) => {
                Some(op)
            }
            ConfirmationState::Idle => None,
        }
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, ConfirmationState::AwaitingConfirmation(_))
    }

    pub fn is_executing(&self) -> bool {
        matches!(self.state, ConfirmationState::Executing(_))
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Captures an operation announced by `confirmation_required`.
    pub fn request(&mut self, op: PendingOperation) -> Result<(), ProtocolError> {
        if let ConfirmationState::AwaitingConfirmation(current) = &self.state {
            if *current == op {
                debug!("ignoring repeated confirmation request");
                return Ok(());
            }
            warn!(
                previous = %current.operation,
                next = %op.operation,
                "replacing an undecided confirmation request"
            );
        } else {
            self.depth += 1;
        }

        if self.depth > self.max_depth {
            let limit = self.max_depth;
            self.reset();
            return Err(ProtocolError::ChainTooDeep { limit });
        }

        debug!(operation = %op.operation, depth = self.depth, "awaiting confirmation");
        self.state = ConfirmationState::AwaitingConfirmation(op);
        Ok(())
    }

    /// Applies the caller's decision. Without a pending operation this is a
    /// protocol error and the coordinator returns to `Idle`.
    pub fn resolve(&mut self, confirmed: bool) -> Result<Resolution, ProtocolError> {
        match std::mem::take(&mut self.state) {
            ConfirmationState::AwaitingConfirmation(op) if confirmed => {
                self.state = ConfirmationState::Executing(op.clone());
                Ok(Resolution::Execute(op))
            }
            ConfirmationState::AwaitingConfirmation(op) => {
                self.depth = 0;
                Ok(Resolution::Reject(op))
            }
            _ => {
                self.reset();
                Err(ProtocolError::NoPendingOperation)
            }
        }
    }

    /// Handles a round's terminal `done`. Returns the operation it cleared,
    /// if the round was the approved sub-stream.
    pub fn finish_round(&mut self) -> Option<PendingOperation> {
        match &self.state {
            ConfirmationState::AwaitingConfirmation(_) => None,
            ConfirmationState::Executing(_) => {
                self.depth = 0;
                match std::mem::take(&mut self.state) {
                    ConfirmationState::Executing(op) => Some(op),
                    _ => None,
                }
            }
            ConfirmationState::Idle => {
                self.depth = 0;
                None
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = ConfirmationState::Idle;
        self.depth = 0;
    }
}
