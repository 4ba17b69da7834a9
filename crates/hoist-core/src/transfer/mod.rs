//! Transfer of built closures to the target host.

pub mod nix_copy;

use crate::artifact::BuiltArtifact;
use crate::error::TransferError;
use crate::process::CancelToken;
use crate::types::Target;

pub use nix_copy::NixCopyChannel;

/// Copies an artifact and its dependency closure to a target.
///
/// Copying content the target already holds must be a successful no-op, so
/// callers may retry freely.
pub trait TransferChannel {
    fn copy_to(
        &self,
        target: &Target,
        artifact: &BuiltArtifact,
        cancel: &CancelToken,
    ) -> Result<(), TransferError>;
}
