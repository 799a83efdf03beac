//! One-shot reconciliation of caller-owned step flags with remote status.

use tracing::debug;

use crate::api::{StatusSnapshot, StatusSource, StepStatus};
use crate::error::PuwError;

/// Local step state owned by the caller and mutated in place.
///
/// At most one of the two flags is true after a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepFlags {
    pub running: bool,
    pub completed: bool,
}

type Hook<'a> = Box<dyn FnOnce(&StatusSnapshot) + Send + 'a>;

/// Optional hooks for [`sync_step_flags`]. At most one status hook fires
/// per sync; `post_sync` always runs last on a successful fetch.
#[derive(Default)]
pub struct SyncHooks<'a> {
    on_running: Option<Hook<'a>>,
    on_completed: Option<Hook<'a>>,
    on_failed: Option<Hook<'a>>,
    post_sync: Option<Hook<'a>>,
}

impl<'a> SyncHooks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_running(mut self, hook: impl FnOnce(&StatusSnapshot) + Send + 'a) -> Self {
        self.on_running = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_completed(mut self, hook: impl FnOnce(&StatusSnapshot) + Send + 'a) -> Self {
        self.on_completed = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_failed(mut self, hook: impl FnOnce(&StatusSnapshot) + Send + 'a) -> Self {
        self.on_failed = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn post_sync(mut self, hook: impl FnOnce(&StatusSnapshot) + Send + 'a) -> Self {
        self.post_sync = Some(Box::new(hook));
        self
    }
}

/// Fetch the current status once and reconcile `flags` for `step`.
///
/// Dispatches exactly one of the status hooks (`pending` dispatches none),
/// then `post_sync`. A failed fetch, or a snapshot missing `step`, returns
/// the error without touching `flags` and without dispatching any hook —
/// the `Err` is the caller's explicit error path.
pub async fn sync_step_flags(
    source: &dyn StatusSource,
    step: &str,
    flags: &mut StepFlags,
    hooks: SyncHooks<'_>,
) -> Result<StatusSnapshot, PuwError> {
    let snapshot = source.get_status().await?;
    let status = snapshot.step_status(step)?;

    flags.running = status == StepStatus::Running;
    flags.completed = status == StepStatus::Passed;

    debug!(
        step,
        status = %status,
        running = flags.running,
        completed = flags.completed,
        "Synced step flags"
    );

    match status {
        StepStatus::Running => {
            if let Some(hook) = hooks.on_running {
                hook(&snapshot);
            }
        }
        StepStatus::Passed => {
            if let Some(hook) = hooks.on_completed {
                hook(&snapshot);
            }
        }
        StepStatus::Failed => {
            if let Some(hook) = hooks.on_failed {
                hook(&snapshot);
            }
        }
        StepStatus::Pending => {}
    }

    if let Some(hook) = hooks.post_sync {
        hook(&snapshot);
    }

    Ok(snapshot)
}
