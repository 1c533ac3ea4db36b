use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::assigner::NoMatch;
use crate::scheduler::compat::Incompatibility;
use crate::scheduler::machine::MachineId;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    NoMatch(#[from] NoMatch),

    #[error("Queue for machine {machine_id} is busy, retry the operation")]
    Conflict { machine_id: MachineId },

    #[error("Invalid position for entry {entry_id}: {detail}")]
    InvalidPosition { entry_id: Uuid, detail: String },

    #[error("Entry {entry_id} cannot move to machine {machine_id}: {reason}")]
    IncompatibleReassignment {
        entry_id: Uuid,
        machine_id: MachineId,
        reason: Incompatibility,
    },

    #[error("Entry not found: {0}")]
    EntryNotFound(Uuid),

    #[error("Machine not found: {0}")]
    MachineNotFound(MachineId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid transition for entry {entry_id}: {detail}")]
    InvalidTransition { entry_id: Uuid, detail: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Conflicts are transient; every other error is final for the given input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Conflict { .. })
    }

    /// Stable machine-readable tag, used by the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::NoMatch(_) => "no_match",
            SchedulerError::Conflict { .. } => "conflict",
            SchedulerError::InvalidPosition { .. } => "invalid_position",
            SchedulerError::IncompatibleReassignment { .. } => "incompatible_reassignment",
            SchedulerError::EntryNotFound(_) => "entry_not_found",
            SchedulerError::MachineNotFound(_) => "machine_not_found",
            SchedulerError::InvalidRequest(_) => "invalid_request",
            SchedulerError::InvalidTransition { .. } => "invalid_transition",
            SchedulerError::Internal(_) => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate machine id {0}")]
    DuplicateMachine(MachineId),

    #[error("Fleet contains no machines")]
    EmptyFleet,

    #[error("Invalid configuration for machine {id}: {detail}")]
    InvalidMachine { id: MachineId, detail: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
