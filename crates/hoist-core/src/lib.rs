//! Hoist Core Library
//!
//! Deploys one package to one remote host in four phases: build it locally,
//! copy its closure to the host, remove the host's current profile entry for
//! the package, then install the new store path.

pub mod artifact;
pub mod commands;
pub mod config;
pub mod deploy;
pub mod error;
pub mod process;
pub mod profile;
pub mod remote;
pub mod transfer;
pub mod types;

/// Re-exports of commonly used types
pub mod prelude {
    pub use crate::artifact::{ArtifactResolver, BuiltArtifact, GcPin, NixResolver};
    pub use crate::commands::{DeployCommand, DeployOptions};
    pub use crate::config::{ConfigStore, HoistConfig};
    pub use crate::deploy::{
        DeployJournal, DeployOrchestrator, DeployReport, DeployRequest, DeployState, HostLock,
        JournalStore,
    };
    pub use crate::error::{
        BuildError, DeployError, InstallError, Phase, RemoveError, TransferError,
    };
    pub use crate::process::{CancelToken, CommandRunner, CommandSpec, SystemRunner};
    pub use crate::profile::{NixProfile, ProfileManager, RemoveOutcome};
    pub use crate::remote::{RemoteShell, SshOptions, SshTarget};
    pub use crate::transfer::{NixCopyChannel, TransferChannel};
    pub use crate::types::{PackageReference, StorePath, Target};
}
