//! Running external programs (nix, ssh) with captured output.

use std::fmt;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::cancel::{CancelToken, Interrupt};

/// Failure to run a command to a successful exit.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully. `diagnostic` is its stderr
    /// (or stdout when stderr is empty), unmodified apart from trimming.
    #[error("{program} exited with {status}: {diagnostic}")]
    Failed {
        program: String,
        status: String,
        diagnostic: String,
    },

    #[error("{program} was stopped: {reason}")]
    Interrupted { program: String, reason: Interrupt },
}

impl CommandError {
    /// The verbatim diagnostic of a failed program, if it ran at all.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            CommandError::Failed { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}

/// A program invocation: program, arguments and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={value:?} ")?;
        }
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stderr if present, else stdout, else the exit status.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        self.status()
    }

    fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "signal".to_string(),
        }
    }

    /// Turn an unsuccessful exit into [`CommandError::Failed`].
    pub fn into_success(self, spec: &CommandSpec) -> Result<Self, CommandError> {
        if self.success {
            return Ok(self);
        }
        Err(self.into_error(spec))
    }

    /// Describe this output as a failure of `spec`, whatever its status.
    pub fn into_error(self, spec: &CommandSpec) -> CommandError {
        CommandError::Failed {
            program: spec.program.clone(),
            status: self.status(),
            diagnostic: self.diagnostic(),
        }
    }
}

/// Seam between the deploy components and the programs they drive.
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion. A non-zero exit is still `Ok`; only failure
    /// to start, or interruption through `cancel`, is an error.
    fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput, CommandError>;

    /// Run `spec` and require a successful exit.
    fn run_checked(
        &self,
        spec: &CommandSpec,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, CommandError> {
        self.run(spec, cancel)?.into_success(spec)
    }
}

/// Runs programs on the local machine with `tokio::process`.
///
/// Each call drives its own current-thread runtime, so callers stay
/// synchronous.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, CommandError> {
        let spawn_error = |source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(spawn_error)?;
        runtime.block_on(run_child(spec, cancel))
    }
}

async fn run_child(
    spec: &CommandSpec,
    cancel: &CancelToken,
) -> Result<CommandOutput, CommandError> {
    tracing::debug!(command = %spec, "running");
    let spawn_error = |source| CommandError::Spawn {
        program: spec.program.clone(),
        source,
    };

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_error)?;

    // Drain both pipes concurrently so a chatty child cannot block on a full pipe.
    let stdout = child.stdout.take().map(|pipe| tokio::spawn(read_all(pipe)));
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_all(pipe)));

    let status = tokio::select! {
        status = child.wait() => status.map_err(spawn_error)?,
        reason = cancel.fired() => {
            tracing::warn!(command = %spec, %reason, "stopping command");
            let _ = child.kill().await;
            return Err(CommandError::Interrupted {
                program: spec.program.clone(),
                reason,
            });
        }
    };

    Ok(CommandOutput {
        success: status.success(),
        code: status.code(),
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
    })
}

async fn read_all<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}
