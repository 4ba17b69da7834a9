//! Artifact resolution: package reference to pinned store path and name.

pub mod nix;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::types::{PackageReference, StorePath};

pub use nix::NixResolver;

/// A built, content-addressed artifact ready to be shipped.
///
/// `package_name` is stable across builds of the same package while
/// `store_path` changes with every distinct build.
pub struct BuiltArtifact {
    pub store_path: StorePath,
    pub package_name: String,
    pin: Option<GcPin>,
}

impl BuiltArtifact {
    pub fn new(store_path: StorePath, package_name: impl Into<String>) -> Self {
        Self {
            store_path,
            package_name: package_name.into(),
            pin: None,
        }
    }

    /// Attach the GC root that keeps `store_path` alive.
    pub fn with_pin(mut self, pin: GcPin) -> Self {
        self.pin = Some(pin);
        self
    }

    pub fn pin(&self) -> Option<&GcPin> {
        self.pin.as_ref()
    }
}

impl fmt::Debug for BuiltArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltArtifact")
            .field("store_path", &self.store_path)
            .field("package_name", &self.package_name)
            .field("pinned", &self.pin.is_some())
            .finish()
    }
}

/// An out-link registered as a GC root. Removed when dropped, which releases
/// the store path for garbage collection again.
#[derive(Debug)]
pub struct GcPin {
    link: PathBuf,
}

impl GcPin {
    pub fn new(link: PathBuf) -> Self {
        Self { link }
    }

    pub fn path(&self) -> &Path {
        &self.link
    }
}

impl Drop for GcPin {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.link) {
            Ok(()) => tracing::debug!(link = %self.link.display(), "released GC root"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(link = %self.link.display(), error = %e, "failed to release GC root")
            }
        }
    }
}

/// Builds a package reference into an artifact.
///
/// Implementations block until the build finishes and must keep the
/// returned store path from being collected while the artifact is alive.
pub trait ArtifactResolver {
    fn resolve(&self, reference: &PackageReference) -> Result<BuiltArtifact, BuildError>;
}
