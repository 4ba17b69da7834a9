//! The remote host's active profile: package name to active store path.

pub mod nix_profile;

use serde::{Deserialize, Serialize};

use crate::error::{InstallError, RemoveError};
use crate::process::CancelToken;
use crate::types::{StorePath, Target};

pub use nix_profile::{NixProfile, active_path_in_listing};

/// What a remove-by-name call found on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoveOutcome {
    /// An entry existed and was removed.
    Removed,
    /// No entry existed; nothing was changed.
    Absent,
}

/// Remove and install operations on a target's profile.
///
/// The two operations are not atomic with respect to each other. Callers
/// must finish a remove before installing under the same name.
pub trait ProfileManager {
    /// The store path currently active under `name`, if any.
    fn active_entry(
        &self,
        target: &Target,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<Option<StorePath>, RemoveError>;

    /// Remove the entry for `name`. An absent entry is a success.
    fn remove_by_name(
        &self,
        target: &Target,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<RemoveOutcome, RemoveError>;

    /// Make `path` the active entry for its package.
    fn install_path(
        &self,
        target: &Target,
        path: &StorePath,
        cancel: &CancelToken,
    ) -> Result<(), InstallError>;
}
