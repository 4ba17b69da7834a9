//! Shared value types for references, targets and store paths.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default build variant when neither `--system` nor `SYSTEM` is given.
pub const DEFAULT_SYSTEM: &str = "x86_64-linux";

const STORE_HASH_LEN: usize = 32;

/// An opaque selector for what to build, e.g. `.#packages.x86_64-linux.default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageReference(String);

impl PackageReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Build the reference for `packages.<system>.<attr>` of a flake.
    ///
    /// A flake argument that already names an output (contains `#`) is used as is.
    pub fn for_flake(flake: &str, system: &str, attr: &str) -> Self {
        if flake.contains('#') {
            return Self(flake.to_string());
        }
        Self(format!("{flake}#packages.{system}.{attr}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote host address as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A content-addressed store path such as `/nix/store/<hash>-foo-1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part of the final component after the hash: `foo-1.0`.
    pub fn name(&self) -> &str {
        let base = self.0.rsplit('/').next().unwrap_or(&self.0);
        match base.split_once('-') {
            Some((hash, name)) if hash.len() == STORE_HASH_LEN => name,
            _ => base,
        }
    }

    /// Whether this path looks like a build of the package called `package`.
    ///
    /// Matches `foo` and `foo-<version>` but not `foo-bar`.
    pub fn is_build_of(&self, package: &str) -> bool {
        match self.name().strip_prefix(package) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix('-')
                .and_then(|version| version.chars().next())
                .is_some_and(|c| c.is_ascii_digit()),
            None => false,
        }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
