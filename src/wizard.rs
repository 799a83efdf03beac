//! Sequencing of the fixed upgrade steps.
//!
//! The admin server owns step progression; the wizard follows it, watching
//! one step at a time until the whole sequence has passed.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{StatusSnapshot, StatusSource};
use crate::error::PuwError;
use crate::sync::{StepFlags, SyncHooks, sync_step_flags};
use crate::watch::{RunningHook, StepWatcher, WatchParams};

/// Named upgrade step, spelled exactly as in the status API contract.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStep {
    Prechecks,
    Prepare,
    BackupCrowbar,
    RepocheckCrowbar,
    Admin,
    Database,
    RepocheckNodes,
    Services,
    BackupOpenstack,
    Nodes,
    Finished,
}

impl UpgradeStep {
    /// Steps in the order the admin server advances them.
    pub const SEQUENCE: [Self; 11] = [
        Self::Prechecks,
        Self::Prepare,
        Self::BackupCrowbar,
        Self::RepocheckCrowbar,
        Self::Admin,
        Self::Database,
        Self::RepocheckNodes,
        Self::Services,
        Self::BackupOpenstack,
        Self::Nodes,
        Self::Finished,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prechecks => "prechecks",
            Self::Prepare => "prepare",
            Self::BackupCrowbar => "backup_crowbar",
            Self::RepocheckCrowbar => "repocheck_crowbar",
            Self::Admin => "admin",
            Self::Database => "database",
            Self::RepocheckNodes => "repocheck_nodes",
            Self::Services => "services",
            Self::BackupOpenstack => "backup_openstack",
            Self::Nodes => "nodes",
            Self::Finished => "finished",
        }
    }

    fn position(self) -> usize {
        Self::SEQUENCE.iter().position(|&s| s == self).unwrap_or(0)
    }

    /// The step after this one, or `None` at the end of the sequence.
    pub fn next(self) -> Option<Self> {
        Self::SEQUENCE.get(self.position() + 1).copied()
    }
}

impl std::fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeStep {
    type Err = PuwError;

    fn from_str(s: &str) -> Result<Self, PuwError> {
        Self::SEQUENCE
            .iter()
            .find(|step| step.as_str() == s)
            .copied()
            .ok_or_else(|| PuwError::UnknownStep(s.to_string()))
    }
}

/// Summary of a completed wizard run.
#[derive(Debug, Clone, Serialize)]
pub struct WizardReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Steps that were actually watched (already-passed steps are skipped).
    pub steps_watched: Vec<String>,
}

/// Drives the upgrade step sequence against a status source.
pub struct UpgradeWizard {
    source: Arc<dyn StatusSource>,
    watcher: StepWatcher,
    poll_interval: Duration,
    downtime_allowance: Duration,
}

impl UpgradeWizard {
    pub fn new(
        source: Arc<dyn StatusSource>,
        poll_interval: Duration,
        downtime_allowance: Duration,
    ) -> Self {
        let watcher = StepWatcher::new(Arc::clone(&source));
        Self {
            source,
            watcher,
            poll_interval,
            downtime_allowance,
        }
    }

    /// Drive the upgrade from `from` (or the backend's current step) through
    /// the end of the sequence.
    pub async fn run(&self, from: Option<UpgradeStep>) -> Result<WizardReport> {
        let started_at = Utc::now();

        let initial = self
            .source
            .get_status()
            .await
            .context("Initial status fetch failed")?;

        let start = match from {
            Some(step) => step,
            None => initial
                .current_step
                .as_deref()
                .map(UpgradeStep::from_str)
                .transpose()
                .context("Backend reported an unrecognized current step")?
                .unwrap_or(UpgradeStep::Prechecks),
        };

        info!(start_step = %start, "Starting upgrade wizard");

        let mut steps_watched = Vec::new();
        for &step in &UpgradeStep::SEQUENCE[start.position()..] {
            let mut flags = StepFlags::default();
            sync_step_flags(self.source.as_ref(), step.as_str(), &mut flags, SyncHooks::new())
                .await
                .with_context(|| format!("Failed to sync flags for step '{step}'"))?;

            if flags.completed {
                info!(step = %step, "Step already passed, skipping");
                continue;
            }
            if flags.running {
                info!(step = %step, "Step already running, watching until it ends");
            }

            steps_watched.push(step.as_str().to_string());
            self.watch_single(step).await?;
        }

        let report = WizardReport {
            started_at,
            completed_at: Utc::now(),
            steps_watched,
        };
        info!(
            steps_watched = report.steps_watched.len(),
            "Upgrade wizard finished"
        );
        Ok(report)
    }

    /// Watch one step until it terminates, logging progress along the way.
    pub async fn watch_single(&self, step: UpgradeStep) -> Result<StatusSnapshot> {
        info!(step = %step, "Waiting for step to end");

        let params = WatchParams::new(step.as_str(), self.poll_interval)
            .with_downtime_allowance(self.downtime_allowance);

        let snapshot = self
            .watcher
            .wait_for_step(params, Some(progress_hook(step)))
            .await
            .with_context(|| format!("Upgrade step '{step}' did not complete"))?;

        info!(step = %step, "Step passed");
        Ok(snapshot)
    }
}

/// Progress logger for non-terminal ticks: surfaces the backend's substep
/// and node metadata when present.
fn progress_hook(step: UpgradeStep) -> RunningHook {
    Box::new(move |snapshot| {
        info!(
            step = %step,
            substep = snapshot.current_substep.as_deref().unwrap_or("-"),
            node = node_name(snapshot).unwrap_or("-"),
            "Step in progress"
        );
    })
}

fn node_name(snapshot: &StatusSnapshot) -> Option<&str> {
    snapshot.current_node.as_ref()?.get("name")?.as_str()
}
