//! Resolve flake outputs with `nix build` and `nix derivation show`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::Value;

use crate::artifact::{ArtifactResolver, BuiltArtifact, GcPin};
use crate::error::BuildError;
use crate::process::{CancelToken, CommandRunner, CommandSpec};
use crate::types::{PackageReference, StorePath};

const ROOT_PREFIX: &str = "deploy-";

/// Out-links older than this were left behind by a killed deploy.
const STALE_ROOT_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Builds flake outputs locally and pins them with an out-link GC root.
pub struct NixResolver {
    runner: Arc<dyn CommandRunner>,
    nix: String,
    gcroots_dir: PathBuf,
}

impl NixResolver {
    pub fn new(runner: Arc<dyn CommandRunner>, gcroots_dir: PathBuf) -> Self {
        Self {
            runner,
            nix: "nix".to_string(),
            gcroots_dir,
        }
    }

    /// Use a specific `nix` binary.
    pub fn with_nix(mut self, nix: impl Into<String>) -> Self {
        self.nix = nix.into();
        self
    }

    fn root_link(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        self.gcroots_dir
            .join(format!("{ROOT_PREFIX}{}-{}", stamp, std::process::id()))
    }

    /// `env.pname` of the derivation that produced `store_path`.
    ///
    /// Read from the build result, so it always describes the same revision
    /// as `store_path`.
    fn package_name(
        &self,
        store_path: &StorePath,
        cancel: &CancelToken,
    ) -> Result<String, BuildError> {
        let show = CommandSpec::new(&self.nix)
            .args(["derivation", "show"])
            .arg(store_path.as_str());
        let output = self
            .runner
            .run_checked(&show, cancel)
            .map_err(|source| BuildError::PackageName {
                path: store_path.clone(),
                source,
            })?;
        let pname =
            pname_in_derivation(&output.stdout).map_err(|source| BuildError::Derivation {
                path: store_path.clone(),
                source,
            })?;
        Ok(pname.unwrap_or_default())
    }
}

/// The first `env.pname` in `nix derivation show` output. Newer nix nests
/// the derivations under a `derivations` key.
pub fn pname_in_derivation(json: &str) -> Result<Option<String>, serde_json::Error> {
    let value: Value = serde_json::from_str(json)?;
    let derivations = value.get("derivations").unwrap_or(&value);
    Ok(derivations
        .as_object()
        .into_iter()
        .flat_map(|map| map.values())
        .find_map(|drv| drv.get("env")?.get("pname")?.as_str())
        .map(|pname| pname.trim().to_string()))
}

/// Remove out-links that outlived the deploy that created them.
fn sweep_stale_roots(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(ROOT_PREFIX) {
            continue;
        }
        let path = entry.path();
        let age = std::fs::symlink_metadata(&path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > STALE_ROOT_AGE) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(
                    link = %path.display(),
                    error = %e,
                    "could not remove stale GC root"
                );
            } else {
                tracing::debug!(link = %path.display(), "removed stale GC root");
            }
        }
    }
}

impl ArtifactResolver for NixResolver {
    fn resolve(&self, reference: &PackageReference) -> Result<BuiltArtifact, BuildError> {
        std::fs::create_dir_all(&self.gcroots_dir).map_err(|source| BuildError::Pin {
            path: self.gcroots_dir.clone(),
            source,
        })?;
        sweep_stale_roots(&self.gcroots_dir);

        // Builds inherit whatever cancellation nix itself offers.
        let uncancellable = CancelToken::new();
        let link = self.root_link();

        let build = CommandSpec::new(&self.nix)
            .args(["build", "--print-out-paths", "--out-link"])
            .arg(link.display().to_string())
            .arg(reference.as_str());
        tracing::info!(%reference, "building");
        let output = self
            .runner
            .run_checked(&build, &uncancellable)
            .map_err(|source| BuildError::Build {
                reference: reference.to_string(),
                source,
            })?;

        // From here on the out-link exists; it lives exactly as long as the artifact.
        let pin = GcPin::new(link);

        let store_path = output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(StorePath::new)
            .ok_or_else(|| BuildError::NoOutput {
                reference: reference.to_string(),
            })?;

        let package_name = self.package_name(&store_path, &uncancellable)?;
        if package_name.is_empty() {
            return Err(BuildError::EmptyPackageName {
                reference: reference.to_string(),
            });
        }
        if !store_path.is_build_of(&package_name) {
            tracing::warn!(
                %store_path,
                package = %package_name,
                "store path name does not match the declared package name"
            );
        }

        tracing::info!(%store_path, package = %package_name, "built");
        Ok(BuiltArtifact::new(store_path, package_name).with_pin(pin))
    }
}
