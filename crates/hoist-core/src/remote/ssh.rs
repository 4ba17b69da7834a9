//! SSH addressing and remote command execution.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::TransferError;
use crate::process::{
    CancelToken, CommandError, CommandOutput, CommandRunner, CommandSpec, sh_quote,
};
use crate::types::Target;

/// Option values that would let ssh skip host authentication or prompt.
const FORBIDDEN_OPTIONS: &[(&str, &str)] = &[
    ("stricthostkeychecking", "no"),
    ("stricthostkeychecking", "off"),
    ("userknownhostsfile", "/dev/null"),
    ("batchmode", "no"),
];

/// A target resolved to an ssh destination and optional port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// `user@host` or `host`
    pub destination: String,
    pub port: Option<u16>,
}

impl SshTarget {
    /// Parse a target address.
    ///
    /// Supports formats:
    /// - "user@host" -> ("user@host", None)
    /// - "user@host:port" -> ("user@host", Some(port))
    /// - "ssh://user@host[:port]" and "ssh-ng://user@host[:port]"
    ///
    /// Any other `scheme://` is rejected so the transfer never falls back to
    /// an unauthenticated store protocol.
    pub fn parse(target: &Target) -> Result<Self, TransferError> {
        let raw = target.as_str().trim();
        let address = match raw.split_once("://") {
            Some(("ssh" | "ssh-ng", rest)) => rest,
            Some((scheme, _)) => {
                return Err(TransferError::UnsupportedTransport {
                    target: raw.to_string(),
                    scheme: scheme.to_string(),
                });
            }
            None => raw,
        };
        let address = address.trim_end_matches('/');

        if address.is_empty() {
            return Err(invalid(raw, "no host given"));
        }
        if address.contains('/') || address.chars().any(char::is_whitespace) {
            return Err(invalid(raw, "expected user@host or user@host:port"));
        }
        if address.starts_with('-') {
            return Err(invalid(raw, "host must not start with '-'"));
        }

        // Only treat the suffix as a port if it parses as a valid u16
        if let Some((host, port)) = address.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                if host.is_empty() {
                    return Err(invalid(raw, "no host given"));
                }
                return Ok(Self {
                    destination: host.to_string(),
                    port: Some(port),
                });
            }
        }

        Ok(Self {
            destination: address.to_string(),
            port: None,
        })
    }

    /// The store URL `nix copy` should push to.
    pub fn store_url(&self) -> String {
        format!("ssh-ng://{}", self.destination)
    }
}

fn invalid(target: &str, reason: &str) -> TransferError {
    TransferError::InvalidTarget {
        target: target.to_string(),
        reason: reason.to_string(),
    }
}

/// Connection options shared by the copy and remote-exec channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshOptions {
    /// Used when the target does not carry its own port.
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    pub known_hosts_file: Option<PathBuf>,
    /// Extra `-o` options, e.g. `ConnectTimeout=10`.
    pub extra_options: Vec<String>,
}

impl SshOptions {
    /// Reject options that would disable host or user authentication.
    pub fn validate(&self) -> Result<(), String> {
        for option in &self.extra_options {
            let (key, value) = split_option(option);
            if FORBIDDEN_OPTIONS
                .iter()
                .any(|(k, v)| key == *k && value == *v)
            {
                return Err(format!(
                    "ssh option '{option}' would disable authentication checks"
                ));
            }
        }
        Ok(())
    }

    /// Arguments placed before the destination on an ssh command line.
    pub fn ssh_args(&self, target: &SshTarget) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = target.port.or(self.port) {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if let Some(known_hosts) = &self.known_hosts_file {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        for option in &self.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }

    /// The ssh invocation that runs `remote_args` on `target`.
    pub fn command(&self, target: &SshTarget, remote_args: &[&str]) -> CommandSpec {
        let remote = remote_args
            .iter()
            .map(|arg| sh_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        CommandSpec::new("ssh")
            .args(self.ssh_args(target))
            .arg(target.destination.clone())
            .arg("--")
            .arg(remote)
    }

    /// [`command`](Self::command) as a line an operator can paste into a shell.
    pub fn command_line(&self, target: &SshTarget, remote_args: &[&str]) -> String {
        let spec = self.command(target, remote_args);
        std::iter::once(&spec.program)
            .chain(&spec.args)
            .map(|arg| sh_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Split `Key=Value` or `Key Value` into a lowercased pair.
fn split_option(option: &str) -> (String, String) {
    let trimmed = option.trim();
    let (key, value) = trimmed
        .split_once(|c: char| c == '=' || c.is_whitespace())
        .unwrap_or((trimmed, ""));
    let value = value.trim().trim_start_matches('=').trim();
    (key.trim().to_ascii_lowercase(), value.to_ascii_lowercase())
}

/// Whether an ssh diagnostic describes an authentication or host-key failure.
pub fn is_auth_failure(diagnostic: &str) -> bool {
    let text = diagnostic.to_ascii_lowercase();
    text.contains("permission denied")
        || text.contains("host key verification failed")
        || text.contains("remote host identification has changed")
        || text.contains("no supported authentication methods")
        || text.contains("too many authentication failures")
}

/// Runs commands on a target through `ssh`.
#[derive(Clone)]
pub struct RemoteShell {
    runner: Arc<dyn CommandRunner>,
    options: SshOptions,
}

impl std::fmt::Debug for RemoteShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteShell")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RemoteShell {
    pub fn new(runner: Arc<dyn CommandRunner>, options: SshOptions) -> Self {
        Self { runner, options }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn command(&self, target: &SshTarget, remote_args: &[&str]) -> CommandSpec {
        self.options.command(target, remote_args)
    }

    /// Run `remote_args` on `target`; a non-zero exit is returned as output.
    pub fn run(
        &self,
        target: &SshTarget,
        remote_args: &[&str],
        cancel: &CancelToken,
    ) -> Result<CommandOutput, CommandError> {
        let spec = self.command(target, remote_args);
        self.runner.run(&spec, cancel)
    }

    /// Run `remote_args` on `target` and require a successful exit.
    pub fn run_checked(
        &self,
        target: &SshTarget,
        remote_args: &[&str],
        cancel: &CancelToken,
    ) -> Result<CommandOutput, CommandError> {
        let spec = self.command(target, remote_args);
        self.runner.run_checked(&spec, cancel)
    }

    /// Value for `NIX_SSHOPTS` so `nix copy` connects with the same options.
    pub fn nix_sshopts(&self, target: &SshTarget) -> String {
        self.options.ssh_args(target).join(" ")
    }
}
