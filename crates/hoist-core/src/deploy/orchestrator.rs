//! Build → transfer → remove → install, stopping at the first failure.

use std::time::Duration;

use crate::artifact::ArtifactResolver;
use crate::error::{DeployError, Phase, RemoveError};
use crate::process::{CancelToken, CommandError};
use crate::profile::{ProfileManager, RemoveOutcome};
use crate::transfer::TransferChannel;
use crate::types::{PackageReference, StorePath, Target};

/// Budget for re-reading the profile after a remove was cut off.
const RECHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Input for one deploy.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub target: Target,
    pub reference: PackageReference,
    /// Last store path known to be active on the target, from local records.
    /// Used as the rollback candidate when the host's profile cannot be read.
    pub known_previous: Option<StorePath>,
    /// Deadline for the transfer and remote phases, counted from the end of
    /// the build.
    pub timeout: Option<Duration>,
}

impl DeployRequest {
    pub fn new(target: Target, reference: PackageReference) -> Self {
        Self {
            target,
            reference,
            known_previous: None,
            timeout: None,
        }
    }

    pub fn with_known_previous(mut self, previous: Option<StorePath>) -> Self {
        self.known_previous = previous;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Where a deploy is, or where it ended.
#[derive(Debug)]
pub enum DeployState {
    Building,
    Transferring,
    Removing,
    Installing,
    Done,
    Aborted(DeployError),
}

impl DeployState {
    fn running(phase: Phase) -> Self {
        match phase {
            Phase::Building => DeployState::Building,
            Phase::Transferring => DeployState::Transferring,
            Phase::Removing => DeployState::Removing,
            Phase::Installing => DeployState::Installing,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployState::Done | DeployState::Aborted(_))
    }
}

/// Result of one deploy invocation.
#[derive(Debug)]
pub struct DeployReport {
    pub target: Target,
    pub reference: PackageReference,
    /// `Done` or `Aborted`.
    pub state: DeployState,
    /// Phases entered, in order.
    pub phases: Vec<Phase>,
    pub package_name: Option<String>,
    pub store_path: Option<StorePath>,
    /// Active store path before this deploy touched the profile.
    pub previous: Option<StorePath>,
    pub removed: Option<RemoveOutcome>,
}

impl DeployReport {
    fn new(request: &DeployRequest) -> Self {
        Self {
            target: request.target.clone(),
            reference: request.reference.clone(),
            state: DeployState::Building,
            phases: Vec::new(),
            package_name: None,
            store_path: None,
            previous: None,
            removed: None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DeployState::Done)
    }

    pub fn error(&self) -> Option<&DeployError> {
        match &self.state {
            DeployState::Aborted(err) => Some(err),
            _ => None,
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::info!(target = %self.target, %phase, "entering phase");
        self.state = DeployState::running(phase);
        self.phases.push(phase);
    }
}

/// Sequences resolver, transfer channel and profile manager for one target.
///
/// Remote state is never touched before the transfer has succeeded. There is
/// no automatic rollback: a failed install leaves the host without an active
/// entry and the report says so.
pub struct DeployOrchestrator {
    resolver: Box<dyn ArtifactResolver>,
    channel: Box<dyn TransferChannel>,
    profile: Box<dyn ProfileManager>,
}

impl DeployOrchestrator {
    pub fn new(
        resolver: Box<dyn ArtifactResolver>,
        channel: Box<dyn TransferChannel>,
        profile: Box<dyn ProfileManager>,
    ) -> Self {
        Self {
            resolver,
            channel,
            profile,
        }
    }

    /// Run one deploy to completion. Never panics on phase failures; the
    /// outcome is in [`DeployReport::state`].
    pub fn deploy(&self, request: &DeployRequest, cancel: &CancelToken) -> DeployReport {
        let mut report = DeployReport::new(request);
        match self.execute(request, cancel, &mut report) {
            Ok(()) => {
                tracing::info!(
                    target = %report.target,
                    store_path = ?report.store_path,
                    "deploy done"
                );
                report.state = DeployState::Done;
            }
            Err(err) => {
                if err.is_degraded() {
                    tracing::warn!(
                        target = %report.target,
                        package = ?report.package_name,
                        previous = ?report.previous,
                        "host left without an active entry; operator action required"
                    );
                }
                tracing::error!(
                    target = %report.target,
                    phase = %err.phase(),
                    error = %err,
                    "deploy aborted"
                );
                report.state = DeployState::Aborted(err);
            }
        }
        report
    }

    fn execute(
        &self,
        request: &DeployRequest,
        cancel: &CancelToken,
        report: &mut DeployReport,
    ) -> Result<(), DeployError> {
        let target = &request.target;

        report.enter(Phase::Building);
        let artifact = self.resolver.resolve(&request.reference)?;
        report.package_name = Some(artifact.package_name.clone());
        report.store_path = Some(artifact.store_path.clone());

        // The build is local and unbounded; the deadline starts here.
        let cancel = match request.timeout {
            Some(timeout) => cancel.limited_to(timeout),
            None => cancel.clone(),
        };
        let cancel = &cancel;

        report.enter(Phase::Transferring);
        check_interrupt(cancel, Phase::Transferring)?;
        self.channel.copy_to(target, &artifact, cancel)?;

        report.enter(Phase::Removing);
        check_interrupt(cancel, Phase::Removing)?;
        let name = artifact.package_name.as_str();
        let listed = match self.profile.active_entry(target, name, cancel) {
            Ok(active) => Some(active),
            Err(err) => {
                tracing::warn!(
                    %target,
                    package = name,
                    error = %err,
                    "could not read active entry"
                );
                None
            }
        };
        report.previous = listed
            .clone()
            .flatten()
            .or_else(|| request.known_previous.clone());

        let removed = match listed {
            Some(None) => {
                tracing::debug!(%target, package = name, "no active entry, skipping remote remove");
                RemoveOutcome::Absent
            }
            _ => self
                .profile
                .remove_by_name(target, name, cancel)
                .map_err(|error| self.remove_failure(target, name, error, &report.previous))?,
        };
        report.removed = Some(removed);

        report.enter(Phase::Installing);
        check_interrupt(cancel, Phase::Installing)?;
        self.profile
            .install_path(target, &artifact.store_path, cancel)
            .map_err(|error| DeployError::Install {
                error,
                previous: report.previous.clone(),
            })?;

        // The artifact, and with it the GC pin, lives until the install is done.
        drop(artifact);
        Ok(())
    }

    /// A remove cut off mid-flight may already have run on the host. It is
    /// only a plain failure if a fresh listing still shows the entry.
    fn remove_failure(
        &self,
        target: &Target,
        name: &str,
        error: RemoveError,
        previous: &Option<StorePath>,
    ) -> DeployError {
        let cut_off = matches!(
            error,
            RemoveError::Remote {
                source: CommandError::Interrupted { .. },
                ..
            }
        );
        if !cut_off {
            return DeployError::Remove(error);
        }

        let recheck = CancelToken::with_timeout(RECHECK_TIMEOUT);
        match self.profile.active_entry(target, name, &recheck) {
            Ok(Some(_)) => {
                tracing::debug!(%target, package = name, "entry survived interrupted remove");
                DeployError::Remove(error)
            }
            Ok(None) => DeployError::RemoveInterrupted {
                error,
                previous: previous.clone(),
            },
            Err(err) => {
                tracing::warn!(%target, package = name, error = %err, "could not re-read profile");
                DeployError::RemoveInterrupted {
                    error,
                    previous: previous.clone(),
                }
            }
        }
    }
}

fn check_interrupt(cancel: &CancelToken, phase: Phase) -> Result<(), DeployError> {
    match cancel.interrupted() {
        Some(reason) => Err(DeployError::Interrupted { phase, reason }),
        None => Ok(()),
    }
}
