//! Deploy sequencing plus the local state around it.

pub mod journal;
pub mod lock;
pub mod orchestrator;

pub use journal::{DeployJournal, DeployOutcome, DeployRecord, JournalStore};
pub use lock::{DEFAULT_LOCK_WAIT, HostLock};
pub use orchestrator::{DeployOrchestrator, DeployReport, DeployRequest, DeployState};
