//! Error types for vm-state

use crate::types::{Slot, State};
use std::fmt;
use thiserror::Error;

/// Result type alias for vm-state operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every error, used at the command boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InUse,
    InvalidArgument,
    PermissionDenied,
    BackendFailure,
    Aborted,
}

/// Step of the migrate workflow that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateStep {
    Stop,
    Assign,
    Start,
}

impl MigrateStep {
    /// 1-based position in the stop/assign/start sequence
    pub fn number(&self) -> u8 {
        match self {
            MigrateStep::Stop => 1,
            MigrateStep::Assign => 2,
            MigrateStep::Start => 3,
        }
    }
}

impl fmt::Display for MigrateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrateStep::Stop => "stop",
            MigrateStep::Assign => "assign",
            MigrateStep::Start => "start",
        };
        write!(f, "step {} ({})", self.number(), name)
    }
}

/// Errors that can occur during vm-state operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("State '{0}' already exists")]
    StateAlreadyExists(State),

    #[error("State '{0}' does not exist")]
    StateNotFound(State),

    #[error("State '{state}' is assigned to {slot}. Reassign it first.")]
    StateInUse { state: State, slot: Slot },

    #[error("State '{state}' has dependent clones: {}", .clones.join(", "))]
    StateHasDependents { state: State, clones: Vec<String> },

    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("Dataset '{0}' already exists")]
    DatasetAlreadyExists(String),

    #[error("Dataset '{0}' does not exist")]
    DatasetNotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("ZFS error: {0}")]
    Zfs(String),

    #[error("Systemd error: {0}")]
    Systemd(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Permission denied: must run as root")]
    PermissionDenied,

    #[error("Aborted")]
    Aborted,

    #[error("Migration aborted at {step}: {source}")]
    MigrationFailed {
        step: MigrateStep,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::StateNotFound(_) | Error::SnapshotNotFound(_) | Error::DatasetNotFound(_) => {
                ErrorKind::NotFound
            }
            Error::StateAlreadyExists(_) | Error::DatasetAlreadyExists(_) => {
                ErrorKind::AlreadyExists
            }
            Error::StateInUse { .. } | Error::StateHasDependents { .. } => ErrorKind::InUse,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::PermissionDenied => ErrorKind::PermissionDenied,
            Error::Aborted => ErrorKind::Aborted,
            Error::MigrationFailed { source, .. } => source.kind(),
            Error::Zfs(_)
            | Error::Systemd(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::CommandFailed { .. } => ErrorKind::BackendFailure,
        }
    }

    /// Wrap a failure of one migrate step
    pub(crate) fn migration(step: MigrateStep, source: Error) -> Self {
        Error::MigrationFailed {
            step,
            source: Box::new(source),
        }
    }
}
