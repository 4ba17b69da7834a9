//! Locating and loading hoist.toml.

use std::path::{Path, PathBuf};

use super::{CONFIG_FILE, HoistConfig, parser};

/// The config files that apply to one invocation.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    global_path: Option<PathBuf>,
    project_path: PathBuf,
}

impl ConfigStore {
    /// Global file under the user config directory, project file in the
    /// current directory.
    pub fn from_env() -> anyhow::Result<Self> {
        let global_dir = dirs::config_dir().map(|dir| dir.join("hoist"));
        let project_root = std::env::current_dir()?;
        Ok(Self::from_paths(global_dir, &project_root))
    }

    pub fn from_paths(global_dir: Option<PathBuf>, project_root: &Path) -> Self {
        Self {
            global_path: global_dir.map(|dir| dir.join(CONFIG_FILE)),
            project_path: project_root.join(CONFIG_FILE),
        }
    }

    /// Use one explicit file and nothing else.
    pub fn explicit(path: PathBuf) -> Self {
        Self {
            global_path: None,
            project_path: path,
        }
    }

    pub fn global_path(&self) -> Option<&Path> {
        self.global_path.as_deref()
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Merged configuration. Missing files count as empty.
    pub fn load(&self) -> anyhow::Result<HoistConfig> {
        let mut merged = HoistConfig::new();
        for path in self.global_path.iter().chain(Some(&self.project_path)) {
            if path.exists() {
                tracing::debug!(config = %path.display(), "loading config");
                merged = merged.merge(parser::parse_hoist_toml(path)?);
            }
        }
        Ok(merged)
    }
}

/// `$XDG_STATE_HOME/hoist` on Unix, the local data directory elsewhere.
pub fn default_state_dir() -> anyhow::Result<PathBuf> {
    let base = if cfg!(unix) {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .ok_or_else(|| anyhow::anyhow!("Cannot determine state directory"))?
    } else {
        dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine local app data directory"))?
    };
    Ok(base.join("hoist"))
}
