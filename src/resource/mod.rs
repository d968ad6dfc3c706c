//! Leased concurrent-execution resources ("teams") and their cleanup.

pub mod backend;
pub mod guard;
pub mod name;

pub use backend::{FsResourceBackend, LeaseRecord, LeaseState, ResourceBackend};
pub use guard::{CleanupGuard, CleanupPolicy, CleanupReport, Strategy};
pub use name::ResourceName;
