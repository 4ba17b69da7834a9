//! Deploy command implementation.
//!
//! Resolves settings from flags and config, serialises deploys per target
//! with a host lock, runs the orchestrator against the Nix realisation and
//! records the outcome in the journal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::artifact::NixResolver;
use crate::config::{ConfigStore, HoistConfig, SshConfig, default_state_dir};
use crate::deploy::{
    DEFAULT_LOCK_WAIT, DeployOrchestrator, DeployReport, DeployRequest, HostLock, JournalStore,
};
use crate::process::{CancelToken, CommandRunner, SystemRunner};
use crate::profile::NixProfile;
use crate::remote::{RemoteShell, SshOptions};
use crate::transfer::NixCopyChannel;
use crate::types::{DEFAULT_SYSTEM, PackageReference, StorePath, Target};

const DEFAULT_FLAKE: &str = ".";
const DEFAULT_ATTR: &str = "default";
const DEFAULT_NIX: &str = "nix";

/// Options for the deploy command
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Remote host, e.g. `root@bot.example.org:2222`
    pub target: String,
    pub flake: Option<String>,
    pub attr: Option<String>,
    /// Build variant; usually taken from `SYSTEM`
    pub system: Option<String>,
    pub timeout: Option<Duration>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

impl DeployOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_flake(mut self, flake: impl Into<String>) -> Self {
        self.flake = Some(flake.into());
        self
    }

    pub fn with_attr(mut self, attr: impl Into<String>) -> Self {
        self.attr = Some(attr.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }
}

/// Fully resolved inputs for one deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySettings {
    pub target: Target,
    pub reference: PackageReference,
    pub timeout: Option<Duration>,
    pub nix: String,
    pub ssh: SshOptions,
}

/// Deploy a package to one target
pub struct DeployCommand {
    state_dir: PathBuf,
    config: HoistConfig,
    runner: Arc<dyn CommandRunner>,
    lock_wait: Duration,
}

impl DeployCommand {
    pub fn new(state_dir: PathBuf, config: HoistConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            state_dir,
            config,
            runner,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Config from `config_path` (or the usual global and project files),
    /// default state directory, real processes.
    pub fn with_defaults(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let store = match config_path {
            Some(path) => ConfigStore::explicit(path),
            None => ConfigStore::from_env()?,
        };
        let config = store.load()?;
        let state_dir = match &config.state_dir {
            Some(dir) => dir.clone(),
            None => default_state_dir()?,
        };
        Ok(Self::new(state_dir, config, Arc::new(SystemRunner)))
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Apply flags over config over defaults.
    pub fn settings(&self, options: &DeployOptions) -> anyhow::Result<DeploySettings> {
        let flags = HoistConfig {
            flake: options.flake.clone(),
            attr: options.attr.clone(),
            system: options.system.clone(),
            ssh: SshConfig {
                port: options.port,
                identity_file: options.identity_file.clone(),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = self.config.clone().merge(flags);
        merged.validate().context("Invalid deploy settings")?;

        if options.target.trim().is_empty() {
            anyhow::bail!("No target given");
        }
        if options.timeout.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("Timeout must be greater than zero");
        }

        let reference = PackageReference::for_flake(
            merged.flake.as_deref().unwrap_or(DEFAULT_FLAKE),
            merged.system.as_deref().unwrap_or(DEFAULT_SYSTEM),
            merged.attr.as_deref().unwrap_or(DEFAULT_ATTR),
        );

        Ok(DeploySettings {
            target: Target::new(options.target.trim()),
            reference,
            timeout: options
                .timeout
                .or(merged.timeout_secs.map(Duration::from_secs)),
            nix: merged.nix.unwrap_or_else(|| DEFAULT_NIX.to_string()),
            ssh: merged.ssh.to_options(),
        })
    }

    /// Run one deploy. `Err` means the deploy never started; a started deploy
    /// always returns its report, aborted or not.
    pub fn execute(
        &self,
        options: &DeployOptions,
        cancel: &CancelToken,
    ) -> anyhow::Result<DeployReport> {
        let settings = self.settings(options)?;
        let locks = self.state_dir.join("locks");
        let _lock = HostLock::acquire(&locks, &settings.target, self.lock_wait)?;

        let journal = JournalStore::new(&self.state_dir);
        let known_previous = self.known_previous(&journal, &settings);

        let request = DeployRequest::new(settings.target.clone(), settings.reference.clone())
            .with_known_previous(known_previous)
            .with_timeout(settings.timeout);
        let report = self.orchestrator(&settings).deploy(&request, cancel);

        if let Err(e) = journal.record(&report) {
            tracing::warn!(
                journal = %journal.path().display(),
                error = %format!("{e:#}"),
                "failed to record deploy"
            );
        }
        Ok(report)
    }

    fn known_previous(
        &self,
        journal: &JournalStore,
        settings: &DeploySettings,
    ) -> Option<StorePath> {
        match journal.load() {
            Ok(journal) => journal
                .rollback_candidate(&settings.target, &settings.reference)
                .cloned(),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "ignoring unreadable deploy journal");
                None
            }
        }
    }

    fn orchestrator(&self, settings: &DeploySettings) -> DeployOrchestrator {
        let shell = RemoteShell::new(Arc::clone(&self.runner), settings.ssh.clone());
        DeployOrchestrator::new(
            Box::new(
                NixResolver::new(Arc::clone(&self.runner), self.state_dir.join("gcroots"))
                    .with_nix(&settings.nix),
            ),
            Box::new(NixCopyChannel::new(shell.clone()).with_nix(&settings.nix)),
            Box::new(NixProfile::new(shell).with_nix(&settings.nix)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::ScriptedRunner;
    use tempfile::TempDir;

    fn command(config: HoistConfig) -> (TempDir, DeployCommand) {
        let dir = TempDir::new().unwrap();
        let command = DeployCommand::new(
            dir.path().to_path_buf(),
            config,
            Arc::new(ScriptedRunner::new(Vec::new())),
        );
        (dir, command)
    }

    #[test]
    fn defaults_build_default_package_for_default_system() {
        let (_dir, command) = command(HoistConfig::new());
        let settings = command.settings(&DeployOptions::new("host")).unwrap();
        assert_eq!(
            settings.reference.as_str(),
            ".#packages.x86_64-linux.default"
        );
        assert_eq!(settings.nix, "nix");
        assert_eq!(settings.timeout, None);
    }

    #[test]
    fn flags_override_config() {
        let (_dir, command) = command(HoistConfig {
            flake: Some("github:org/bots".to_string()),
            attr: Some("xecut-bot".to_string()),
            system: Some("aarch64-linux".to_string()),
            timeout_secs: Some(600),
            ssh: SshConfig {
                port: Some(22),
                ..Default::default()
            },
            ..Default::default()
        });
        let options = DeployOptions::new("root@bot")
            .with_system("x86_64-linux")
            .with_timeout(Duration::from_secs(30))
            .with_port(2222);

        let settings = command.settings(&options).unwrap();
        assert_eq!(
            settings.reference.as_str(),
            "github:org/bots#packages.x86_64-linux.xecut-bot"
        );
        assert_eq!(settings.timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.ssh.port, Some(2222));
    }

    #[test]
    fn sub_second_timeout_is_kept_and_zero_is_rejected() {
        let (_dir, command) = command(HoistConfig::new());
        let options = DeployOptions::new("host").with_timeout(Duration::from_millis(500));
        let settings = command.settings(&options).unwrap();
        assert_eq!(settings.timeout, Some(Duration::from_millis(500)));

        let options = DeployOptions::new("host").with_timeout(Duration::ZERO);
        assert!(command.settings(&options).is_err());
    }

    #[test]
    fn invalid_settings_fail_before_anything_runs() {
        let (_dir, command) = command(HoistConfig::new());
        assert!(command.settings(&DeployOptions::new("  ")).is_err());
        assert!(
            command
                .settings(&DeployOptions::new("host").with_attr(""))
                .is_err()
        );
    }

    #[test]
    fn busy_target_is_refused_before_building() {
        let (dir, command) = command(HoistConfig::new());
        let command = command.with_lock_wait(Duration::ZERO);
        let locks = dir.path().join("locks");
        let _held = HostLock::acquire(&locks, &Target::new("host"), Duration::ZERO).unwrap();

        let err = command
            .execute(&DeployOptions::new("host"), &CancelToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("in progress"));
    }
}
