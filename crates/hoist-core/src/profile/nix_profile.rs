//! `nix profile` on the target, driven over ssh.

use serde_json::Value;

use crate::error::{InstallError, RemoveError};
use crate::process::CancelToken;
use crate::profile::{ProfileManager, RemoveOutcome};
use crate::remote::{RemoteShell, SshTarget};
use crate::types::{StorePath, Target};

/// Manages the default profile of the ssh user on the target.
#[derive(Debug, Clone)]
pub struct NixProfile {
    shell: RemoteShell,
    nix: String,
}

impl NixProfile {
    pub fn new(shell: RemoteShell) -> Self {
        Self {
            shell,
            nix: "nix".to_string(),
        }
    }

    /// Use a specific `nix` binary on the target.
    pub fn with_nix(mut self, nix: impl Into<String>) -> Self {
        self.nix = nix.into();
        self
    }
}

impl ProfileManager for NixProfile {
    fn active_entry(
        &self,
        target: &Target,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<Option<StorePath>, RemoveError> {
        let ssh = SshTarget::parse(target)?;
        let output = self
            .shell
            .run_checked(&ssh, &[self.nix.as_str(), "profile", "list", "--json"], cancel)
            .map_err(|source| RemoveError::List {
                target: target.to_string(),
                source,
            })?;
        active_path_in_listing(&output.stdout, name).map_err(|source| RemoveError::Listing {
            target: target.to_string(),
            source,
        })
    }

    fn remove_by_name(
        &self,
        target: &Target,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<RemoveOutcome, RemoveError> {
        let ssh = SshTarget::parse(target)?;
        let args = [self.nix.as_str(), "profile", "remove", name];
        let remote_error = |source| RemoveError::Remote {
            name: name.to_string(),
            target: target.to_string(),
            source,
        };

        tracing::info!(%target, package = name, "removing profile entry");
        let output = self.shell.run(&ssh, &args, cancel).map_err(remote_error)?;

        // Older nix exits 0 with a warning, newer nix fails; both mean absent.
        if reports_no_match(&output.stderr) {
            tracing::debug!(%target, package = name, "no profile entry to remove");
            return Ok(RemoveOutcome::Absent);
        }
        if output.success {
            return Ok(RemoveOutcome::Removed);
        }
        Err(remote_error(output.into_error(&self.shell.command(&ssh, &args))))
    }

    fn install_path(
        &self,
        target: &Target,
        path: &StorePath,
        cancel: &CancelToken,
    ) -> Result<(), InstallError> {
        let ssh = SshTarget::parse(target)?;
        tracing::info!(%target, store_path = %path, "installing profile entry");
        self.shell
            .run_checked(&ssh, &[self.nix.as_str(), "profile", "install", path.as_str()], cancel)
            .map_err(|source| InstallError::Remote {
                path: path.clone(),
                target: target.to_string(),
                source,
            })?;
        Ok(())
    }
}

fn reports_no_match(stderr: &str) -> bool {
    stderr.contains("does not match any packages")
}

/// Find the active store path for `name` in `nix profile list --json` output.
///
/// Newer listings key elements by name. Older ones are a list; there the
/// element whose store path is a build of `name` is taken.
pub fn active_path_in_listing(
    listing: &str,
    name: &str,
) -> Result<Option<StorePath>, serde_json::Error> {
    let listing: Value = serde_json::from_str(listing)?;
    let found = match listing.get("elements") {
        Some(Value::Object(elements)) => elements.get(name).and_then(first_store_path),
        Some(Value::Array(elements)) => elements
            .iter()
            .filter_map(first_store_path)
            .find(|path| path.is_build_of(name)),
        _ => None,
    };
    Ok(found)
}

fn first_store_path(element: &Value) -> Option<StorePath> {
    if element.get("active").and_then(Value::as_bool) == Some(false) {
        return None;
    }
    element
        .get("storePaths")?
        .as_array()?
        .iter()
        .find_map(Value::as_str)
        .map(StorePath::new)
}
