//! Local record of the last deploy per target and package reference.
//!
//! The journal is what lets an operator (or the next deploy) find the store
//! path that was active before a failed install left the host empty.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::orchestrator::{DeployReport, DeployState};
use crate::error::Phase;
use crate::profile::RemoveOutcome;
use crate::types::{PackageReference, StorePath, Target};

pub const JOURNAL_VERSION: u32 = 1;
const JOURNAL_FILE: &str = "journal.json";

/// How the recorded deploy ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DeployOutcome {
    Done,
    Aborted {
        phase: Phase,
        /// True when the host was left without an active entry.
        degraded: bool,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRecord {
    pub target: Target,
    pub reference: PackageReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<StorePath>,
    /// Most recent store path known to have been active and working.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_good: Option<StorePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<RemoveOutcome>,
    pub outcome: DeployOutcome,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployJournal {
    pub version: u32,
    #[serde(default)]
    pub records: Vec<DeployRecord>,
}

impl Default for DeployJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl DeployJournal {
    pub fn new() -> Self {
        Self {
            version: JOURNAL_VERSION,
            records: Vec::new(),
        }
    }

    pub fn find(&self, target: &Target, reference: &PackageReference) -> Option<&DeployRecord> {
        self.records
            .iter()
            .find(|r| &r.target == target && &r.reference == reference)
    }

    /// The store path to reinstall if the host has lost its entry.
    pub fn rollback_candidate(
        &self,
        target: &Target,
        reference: &PackageReference,
    ) -> Option<&StorePath> {
        self.find(target, reference)?.last_good.as_ref()
    }

    /// Replace the record for the report's target and reference.
    pub fn record(&mut self, report: &DeployReport) -> &DeployRecord {
        let prior = self
            .find(&report.target, &report.reference)
            .and_then(|r| r.last_good.clone());

        let (outcome, last_good) = match &report.state {
            DeployState::Aborted(err) => (
                DeployOutcome::Aborted {
                    phase: err.phase(),
                    degraded: err.is_degraded(),
                    message: err.to_string(),
                },
                report.previous.clone().or(prior),
            ),
            _ => (DeployOutcome::Done, report.store_path.clone().or(prior)),
        };

        let record = DeployRecord {
            target: report.target.clone(),
            reference: report.reference.clone(),
            package_name: report.package_name.clone(),
            store_path: report.store_path.clone(),
            last_good,
            removed: report.removed,
            outcome,
            recorded_at: Utc::now(),
        };

        self.records
            .retain(|r| !(r.target == record.target && r.reference == record.reference));
        self.records.push(record);
        &self.records[self.records.len() - 1]
    }
}

/// Loads and saves the journal under the state directory.
#[derive(Debug, Clone)]
pub struct JournalStore {
    path: PathBuf,
}

impl JournalStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns an empty journal if none has been written yet.
    pub fn load(&self) -> anyhow::Result<DeployJournal> {
        if !self.path.exists() {
            return Ok(DeployJournal::new());
        }
        let bytes = fs::read(&self.path)
            .with_context(|| format!("Failed to read journal: {}", self.path.display()))?;
        let journal: DeployJournal = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse journal: {}", self.path.display()))?;
        if journal.version != JOURNAL_VERSION {
            anyhow::bail!(
                "Unsupported journal version {} in {} (expected {})",
                journal.version,
                self.path.display(),
                JOURNAL_VERSION
            );
        }
        Ok(journal)
    }

    /// Save atomically (tmp + rename).
    pub fn save(&self, journal: &DeployJournal) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Journal path has no parent directory"))?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let bytes = serde_json::to_vec_pretty(journal).context("Failed to serialize journal")?;
        let tmp_path = dir.join(format!("{JOURNAL_FILE}.{}.tmp", std::process::id()));
        fs::write(&tmp_path, bytes)
            .with_context(|| format!("Failed to write tmp journal: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace journal: {}", self.path.display()))?;
        Ok(())
    }

    /// Load, record `report`, save.
    pub fn record(&self, report: &DeployReport) -> anyhow::Result<DeployRecord> {
        let mut journal = self.load()?;
        let record = journal.record(report).clone();
        self.save(&journal)?;
        Ok(record)
    }
}
