//! Hoist - build, copy and activate a Nix package on a remote host
//!
//! Usage:
//!   hoist root@bot.example.org
//!   SYSTEM=aarch64-linux hoist --attr xecut-bot deploy@pi:2222

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hoist_core::commands::{DeployCommand, DeployOptions, DeploySettings};
use hoist_core::deploy::{DeployReport, DeployState};
use hoist_core::process::CancelToken;
use hoist_core::remote::SshTarget;
use hoist_core::types::StorePath;

#[derive(Parser)]
#[command(name = "hoist")]
#[command(about = "Deploy a flake package to a remote host's Nix profile", long_about = None)]
struct Cli {
    /// Remote host: [user@]host[:port], optionally ssh:// or ssh-ng://
    target: String,

    /// Flake to build from (default: config, else ".")
    #[arg(long)]
    flake: Option<String>,

    /// Package attribute (default: config, else "default")
    #[arg(long)]
    attr: Option<String>,

    /// Build variant, e.g. aarch64-linux
    #[arg(long, env = "SYSTEM")]
    system: Option<String>,

    /// Deadline in seconds for the transfer and remote phases (the build is not limited)
    #[arg(long)]
    timeout: Option<u64>,

    /// SSH port when the target does not name one
    #[arg(long, short)]
    port: Option<u16>,

    /// SSH identity file
    #[arg(long, short)]
    identity: Option<PathBuf>,

    /// Read this config file instead of the global and project hoist.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long, default_value = "table")]
    format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable summary
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
    /// Only report failures
    Quiet,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hoist=info,hoist_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let command = DeployCommand::with_defaults(cli.config)?;
    tracing::debug!(state_dir = %command.state_dir().display(), "using state directory");

    let mut options = DeployOptions::new(cli.target);
    options.flake = cli.flake;
    options.attr = cli.attr;
    options.system = cli.system;
    options.timeout = cli.timeout.map(Duration::from_secs);
    options.port = cli.port;
    options.identity_file = cli.identity;

    let settings = command.settings(&options)?;
    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = command.execute(&options, &cancel)?;
    print_report(&report, &settings, cli.format)?;

    Ok(if report.is_done() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Cancel `cancel` on the first Ctrl-C, so running commands are stopped and
/// the deploy unwinds normally (releasing its lock and GC root).
fn cancel_on_ctrl_c(cancel: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::debug!(error = %e, "no Ctrl-C handler");
                return;
            }
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            tracing::warn!("interrupted, stopping deploy");
            cancel.cancel();
        }
    });
}

/// `ssh ... -- nix profile install <previous>` with the deploy's own ssh options.
fn restore_command(settings: &DeploySettings, previous: &StorePath) -> Option<String> {
    let target = SshTarget::parse(&settings.target).ok()?;
    let remote = [settings.nix.as_str(), "profile", "install", previous.as_str()];
    Some(settings.ssh.command_line(&target, &remote))
}

fn print_report(
    report: &DeployReport,
    settings: &DeploySettings,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("Target:    {}", report.target);
            println!("Package:   {}", report.reference);
            if let Some(name) = &report.package_name {
                println!("Name:      {}", name);
            }
            if let Some(path) = &report.store_path {
                println!("Path:      {}", path);
            }
            if let Some(previous) = &report.previous {
                println!("Previous:  {}", previous);
            }
            if report.is_done() {
                println!("✓ Deployed");
            }
        }
        OutputFormat::Json => {
            let (status, phase, error, degraded) = match &report.state {
                DeployState::Aborted(err) => (
                    "aborted",
                    Some(err.phase()),
                    Some(err.to_string()),
                    err.is_degraded(),
                ),
                _ => ("done", None, None, false),
            };
            let output = serde_json::json!({
                "target": report.target,
                "reference": report.reference,
                "status": status,
                "phases": report.phases,
                "package_name": report.package_name,
                "store_path": report.store_path,
                "previous": report.previous,
                "removed": report.removed,
                "failed_phase": phase,
                "error": error,
                "degraded": degraded,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Quiet => {}
    }

    if let Some(err) = report.error() {
        eprintln!("✗ Deploy aborted while {}: {}", err.phase(), err);
        if err.is_degraded() {
            eprintln!(
                "⚠ {} may be left without an active entry for {}.",
                report.target,
                report.package_name.as_deref().unwrap_or("the package")
            );
            if let Some(command) = err
                .rollback_candidate()
                .and_then(|previous| restore_command(settings, previous))
            {
                eprintln!("  Restore it with: {command}");
            }
        }
    }
    Ok(())
}
