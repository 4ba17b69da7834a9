//! `nix copy` over `ssh-ng://`.

use crate::artifact::BuiltArtifact;
use crate::error::TransferError;
use crate::process::{CancelToken, CommandError, CommandSpec};
use crate::remote::{RemoteShell, SshTarget, is_auth_failure};
use crate::transfer::TransferChannel;
use crate::types::Target;

/// Pushes closures with `nix copy --no-check-sigs --to ssh-ng://<host>`.
///
/// Signatures are not re-checked; the ssh transport authenticates the host.
/// The channel never uses anything but ssh and never lets ssh prompt.
#[derive(Debug, Clone)]
pub struct NixCopyChannel {
    shell: RemoteShell,
    nix: String,
}

impl NixCopyChannel {
    pub fn new(shell: RemoteShell) -> Self {
        Self {
            shell,
            nix: "nix".to_string(),
        }
    }

    pub fn with_nix(mut self, nix: impl Into<String>) -> Self {
        self.nix = nix.into();
        self
    }

    fn command(&self, target: &SshTarget, artifact: &BuiltArtifact) -> CommandSpec {
        CommandSpec::new(&self.nix)
            .args(["copy", "--no-check-sigs", "--to"])
            .arg(target.store_url())
            .arg(artifact.store_path.as_str())
            .env("NIX_SSHOPTS", self.shell.nix_sshopts(target))
    }
}

impl TransferChannel for NixCopyChannel {
    fn copy_to(
        &self,
        target: &Target,
        artifact: &BuiltArtifact,
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        let ssh_target = SshTarget::parse(target)?;
        let spec = self.command(&ssh_target, artifact);

        tracing::info!(%target, store_path = %artifact.store_path, "copying closure");
        let copy_error = |source: CommandError| TransferError::Copy {
            path: artifact.store_path.clone(),
            target: target.to_string(),
            source,
        };

        let output = self.shell.runner().run(&spec, cancel).map_err(copy_error)?;
        if output.success {
            return Ok(());
        }

        let diagnostic = output.diagnostic();
        if is_auth_failure(&diagnostic) {
            return Err(TransferError::Authentication {
                target: target.to_string(),
                diagnostic,
            });
        }
        Err(copy_error(output.into_error(&spec)))
    }
}
