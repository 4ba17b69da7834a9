//! Configuration from `hoist.toml`
//!
//! Two layers are read: the global file under the user config directory and
//! the project file in the current directory. Project values win. Command
//! line flags are applied on top by the commands layer.

pub mod parser;
pub mod store;

use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

use crate::remote::SshOptions;

pub use parser::{parse_hoist_toml, parse_hoist_toml_str};
pub use store::{ConfigStore, default_state_dir};

pub const CONFIG_FILE: &str = "hoist.toml";

/// Contents of one `hoist.toml`. Every field is optional so layers can be
/// merged; defaults are applied at the point of use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HoistConfig {
    /// Flake to build from, `.` when unset.
    #[serde(default)]
    pub flake: Option<String>,

    /// Package attribute, `default` when unset.
    #[serde(default)]
    pub attr: Option<String>,

    #[serde(default)]
    pub system: Option<String>,

    /// Deadline in seconds for the transfer and remote phases.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// `nix` binary, locally and on the target.
    #[serde(default)]
    pub nix: Option<String>,

    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,

    /// Passed to ssh as `-o <option>`.
    #[serde(default)]
    pub extra_options: Vec<String>,
}

impl SshConfig {
    pub fn to_options(&self) -> SshOptions {
        SshOptions {
            port: self.port,
            identity_file: self.identity_file.clone(),
            known_hosts_file: self.known_hosts_file.clone(),
            extra_options: self.extra_options.clone(),
        }
    }
}

impl HoistConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay `layer` on `self`. Set fields in `layer` win; a non-empty
    /// `extra_options` list replaces the base list.
    pub fn merge(mut self, layer: HoistConfig) -> Self {
        fn pick<T>(base: &mut Option<T>, over: Option<T>) {
            if over.is_some() {
                *base = over;
            }
        }

        pick(&mut self.flake, layer.flake);
        pick(&mut self.attr, layer.attr);
        pick(&mut self.system, layer.system);
        pick(&mut self.timeout_secs, layer.timeout_secs);
        pick(&mut self.nix, layer.nix);
        pick(&mut self.state_dir, layer.state_dir);
        pick(&mut self.ssh.port, layer.ssh.port);
        pick(&mut self.ssh.identity_file, layer.ssh.identity_file);
        pick(&mut self.ssh.known_hosts_file, layer.ssh.known_hosts_file);
        if !layer.ssh.extra_options.is_empty() {
            self.ssh.extra_options = layer.ssh.extra_options;
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (field, value) in [
            ("flake", &self.flake),
            ("attr", &self.attr),
            ("system", &self.system),
            ("nix", &self.nix),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                anyhow::bail!("'{}' must not be empty", field);
            }
        }
        if self.timeout_secs == Some(0) {
            anyhow::bail!("'timeout_secs' must be greater than zero");
        }
        self.ssh
            .to_options()
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [ssh] configuration")?;
        Ok(())
    }
}
