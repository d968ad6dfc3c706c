//! Typed error hierarchy for the arc pipeline.
//!
//! Four top-level enums cover the subsystems:
//! - `CheckpointError`: loading, saving and locking checkpoints
//! - `ResourceError`: resource name validation and backend operations
//! - `PhaseError`: registry lookups and phase state transitions
//! - `OrchestratorError`: dispatcher loop failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint {id} not found at {path}")]
    NotFound { id: String, path: PathBuf },

    #[error("Checkpoint at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to write checkpoint at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock run {id} at {path}: {source}")]
    LockFailed {
        id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run {other} is still in progress in this workspace")]
    ConcurrentRun { other: String },

    #[error("Session nonce '{nonce}' in checkpoint {id} is malformed")]
    NonceInvalid { id: String, nonce: String },

    #[error("Invalid run id '{id}': {reason}")]
    InvalidRunId { id: String, reason: String },
}

/// Errors from the resource layer.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Rejected resource name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Resource {name} is busy")]
    Busy { name: String },

    #[error("Resource {name} is registered but its storage is gone")]
    Diverged { name: String },

    #[error("I/O error on resource {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the phase registry and phase records.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("Phase name '{0}' is not a safe identifier")]
    InvalidName(String),

    #[error("Duplicate phase '{0}' in registry")]
    DuplicatePhase(String),

    #[error("Invalid convergence range {start}..={end}")]
    InvalidRange { start: String, end: String },

    #[error("Phase {phase} cannot move from {from} to {to}")]
    InvalidTransition {
        phase: String,
        from: String,
        to: String,
    },
}

/// Errors from the dispatcher loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("Failed to create artifact directory {path}: {source}")]
    ArtifactDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
