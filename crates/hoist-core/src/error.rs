//! Error types for the deploy phases

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::{CommandError, Interrupt};
use crate::types::StorePath;

/// The phases of one deploy, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Building,
    Transferring,
    Removing,
    Installing,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Building => "building",
            Phase::Transferring => "transferring",
            Phase::Removing => "removing",
            Phase::Installing => "installing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolving a package reference to a built artifact failed. Local only.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("could not build {reference}: {source}")]
    Build {
        reference: String,
        #[source]
        source: CommandError,
    },

    #[error("build of {reference} printed no output path")]
    NoOutput { reference: String },

    #[error("could not read the derivation of {path}: {source}")]
    PackageName {
        path: StorePath,
        #[source]
        source: CommandError,
    },

    #[error("unreadable derivation of {path}: {source}")]
    Derivation {
        path: StorePath,
        #[source]
        source: serde_json::Error,
    },

    #[error("{reference} declares no package name (pname)")]
    EmptyPackageName { reference: String },

    #[error("could not prepare GC root directory {}: {source}", .path.display())]
    Pin {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Copying the closure to the target failed. Remote profile untouched.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("target '{target}' does not use an ssh transport ({scheme}://)")]
    UnsupportedTransport { target: String, scheme: String },

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("could not authenticate to {target}: {diagnostic}")]
    Authentication { target: String, diagnostic: String },

    #[error("copying {path} to {target} failed: {source}")]
    Copy {
        path: StorePath,
        target: String,
        #[source]
        source: CommandError,
    },
}

/// Reading or clearing the remote profile entry failed for a reason other
/// than the entry being absent. The old entry is still in place.
#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("removing '{name}' on {target} failed: {source}")]
    Remote {
        name: String,
        target: String,
        #[source]
        source: CommandError,
    },

    #[error("listing the profile on {target} failed: {source}")]
    List {
        target: String,
        #[source]
        source: CommandError,
    },

    #[error("unreadable profile listing from {target}: {source}")]
    Listing {
        target: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Target(#[from] TransferError),
}

/// Activating the new store path failed.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("installing {path} on {target} failed: {source}")]
    Remote {
        path: StorePath,
        target: String,
        #[source]
        source: CommandError,
    },

    #[error(transparent)]
    Target(#[from] TransferError),
}

/// Why a deploy ended in the aborted state.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("remove failed: {0}")]
    Remove(#[from] RemoveError),

    /// The remote remove was cut off and the entry could not be confirmed to
    /// still exist, so the host may have no active entry.
    #[error("remove failed: {error}; the entry may already be gone{}", rollback_hint(.previous))]
    RemoveInterrupted {
        #[source]
        error: RemoveError,
        previous: Option<StorePath>,
    },

    /// The remove step succeeded, so the host has no active entry.
    #[error("install failed: {error}{}", rollback_hint(.previous))]
    Install {
        #[source]
        error: InstallError,
        previous: Option<StorePath>,
    },

    #[error("{phase} cancelled before it started: {reason}")]
    Interrupted { phase: Phase, reason: Interrupt },
}

fn rollback_hint(previous: &Option<StorePath>) -> String {
    match previous {
        Some(path) => format!(" (previously active: {path})"),
        None => String::new(),
    }
}

impl DeployError {
    /// The phase that was running when the deploy aborted.
    pub fn phase(&self) -> Phase {
        match self {
            DeployError::Build(_) => Phase::Building,
            DeployError::Transfer(_) => Phase::Transferring,
            DeployError::Remove(_) | DeployError::RemoveInterrupted { .. } => Phase::Removing,
            DeployError::Install { .. } => Phase::Installing,
            DeployError::Interrupted { phase, .. } => *phase,
        }
    }

    /// Whether the host was left without an active entry for the package.
    ///
    /// True once the remove step may have completed: an install failure, an
    /// interrupted remove, or an interruption right before installing.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            DeployError::Install { .. }
                | DeployError::RemoveInterrupted { .. }
                | DeployError::Interrupted {
                    phase: Phase::Installing,
                    ..
                }
        )
    }

    /// The store path that was active before this deploy, if known.
    pub fn rollback_candidate(&self) -> Option<&StorePath> {
        match self {
            DeployError::Install { previous, .. }
            | DeployError::RemoveInterrupted { previous, .. } => previous.as_ref(),
            _ => None,
        }
    }
}
