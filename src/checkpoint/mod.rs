//! Versioned, resumable run state.
//!
//! - `model`: the checkpoint document, phase records and their transitions
//! - `migrate`: forward-only schema migrations on raw JSON
//! - `store`: atomic persistence, listing and run locks
//! - `integrity`: artifact hashing and demotion of tampered phases

pub mod integrity;
pub mod migrate;
pub mod model;
pub mod store;

pub use integrity::{hash_file, verify_completed};
pub use migrate::migrate;
pub use model::{
    CURRENT_SCHEMA_VERSION, Checkpoint, PhaseRecord, PhaseStatus, RunId, RunStatus,
    TerminalStatus,
};
pub use store::{CheckpointStore, RunLease, RunListing};
