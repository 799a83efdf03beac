//! Step watching: bounded-retry polling of the upgrade status source.
//!
//! A watch polls one named step until the backend reports `passed` or
//! `failed`, absorbing status-source downtime up to a configured allowance.
//! The allowance is tick-counted: each failed fetch consumes one nominal
//! poll interval, regardless of actual fetch latency.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{StatusSnapshot, StatusSource, StepStatus};
use crate::error::PuwError;

/// Hook invoked on every non-terminal tick of a watch.
pub type RunningHook = Box<dyn FnMut(&StatusSnapshot) + Send>;

/// Parameters for a single step watch.
#[derive(Debug, Clone)]
pub struct WatchParams {
    /// Step name as used in the status API response.
    pub step: String,
    /// Delay between status polls. Must be positive.
    pub poll_interval: Duration,
    /// Cumulative status-source downtime tolerated before the watch gives
    /// up. Shared across all failure ticks of the watch, zero by default.
    pub downtime_allowance: Duration,
}

impl WatchParams {
    pub fn new(step: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            step: step.into(),
            poll_interval,
            downtime_allowance: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_downtime_allowance(mut self, allowance: Duration) -> Self {
        self.downtime_allowance = allowance;
        self
    }
}

/// Terminal failure of a watch.
#[derive(Debug, Error)]
pub enum WatchFailure {
    /// The backend reported the watched step as `failed`.
    #[error("step '{step}' reported failure")]
    StepFailed {
        step: String,
        snapshot: StatusSnapshot,
    },

    /// The status source stayed unavailable past the downtime allowance.
    #[error("status source unavailable while watching '{step}': {source}")]
    SourceUnavailable {
        step: String,
        #[source]
        source: PuwError,
    },
}

/// Terminal and progress callbacks for a spawned watch.
///
/// Exactly one of the terminal callbacks is invoked, exactly once, unless
/// the watch is stopped or aborted first.
pub struct WatchCallbacks {
    on_success: Box<dyn FnOnce(StatusSnapshot) + Send>,
    on_failure: Box<dyn FnOnce(WatchFailure) + Send>,
    on_running: Option<RunningHook>,
}

impl WatchCallbacks {
    pub fn new(
        on_success: impl FnOnce(StatusSnapshot) + Send + 'static,
        on_failure: impl FnOnce(WatchFailure) + Send + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
            on_running: None,
        }
    }

    /// Also observe non-terminal ticks.
    #[must_use]
    pub fn on_running(mut self, hook: impl FnMut(&StatusSnapshot) + Send + 'static) -> Self {
        self.on_running = Some(Box::new(hook));
        self
    }
}

/// Handle to a spawned watch.
///
/// Dropping the handle does not stop the watch; callers that tear down
/// mid-poll must call [`stop`](Self::stop) or [`abort`](Self::abort).
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watch cooperatively: no further tick is armed and terminal
    /// callbacks are suppressed. An in-flight fetch settles and its result
    /// is discarded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Abort the watch task outright, dropping any in-flight fetch.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the watch task to terminate.
    pub async fn wait(self) {
        // The join error only reports abort or panic; there is nothing
        // actionable to surface to the caller here.
        let _ = self.task.await;
    }
}

/// Watches upgrade steps against a shared status source.
pub struct StepWatcher {
    source: Arc<dyn StatusSource>,
}

impl StepWatcher {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self { source }
    }

    /// Spawn a watch for `params.step`, delivering the outcome through
    /// `callbacks`.
    pub fn watch_step(&self, params: WatchParams, callbacks: WatchCallbacks) -> WatchHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_watch(
            Arc::clone(&self.source),
            params,
            callbacks,
            cancel.clone(),
        ));
        WatchHandle { cancel, task }
    }

    /// Poll inline until the step terminates, returning the final snapshot.
    ///
    /// Same tick semantics as [`watch_step`](Self::watch_step), without the
    /// spawned task or cancellation surface.
    pub async fn wait_for_step(
        &self,
        params: WatchParams,
        on_running: Option<RunningHook>,
    ) -> Result<StatusSnapshot, WatchFailure> {
        let never = CancellationToken::new();
        match poll_until_terminal(self.source.as_ref(), params, on_running, &never).await {
            Some(outcome) => outcome,
            // The token above is never cancelled.
            None => unreachable!(),
        }
    }
}

/// Body of a spawned watch: poll to a terminal state, then deliver it
/// unless the watch was stopped in the meantime.
async fn run_watch(
    source: Arc<dyn StatusSource>,
    params: WatchParams,
    callbacks: WatchCallbacks,
    cancel: CancellationToken,
) {
    let WatchCallbacks {
        on_success,
        on_failure,
        on_running,
    } = callbacks;
    let step = params.step.clone();

    match poll_until_terminal(source.as_ref(), params, on_running, &cancel).await {
        Some(Ok(snapshot)) if !cancel.is_cancelled() => {
            info!(step = %step, "Step passed, watch complete");
            on_success(snapshot);
        }
        Some(Err(failure)) if !cancel.is_cancelled() => {
            warn!(step = %step, error = %failure, "Watch ended in failure");
            on_failure(failure);
        }
        _ => {
            debug!(step = %step, "Watch stopped before completion");
        }
    }
}

/// The poll loop shared by spawned and inline watches.
///
/// Returns `None` when the watch is stopped through `cancel` before a
/// terminal state is reached. At most one fetch is in flight at any time;
/// the next tick is armed only after the previous fetch has settled.
async fn poll_until_terminal(
    source: &dyn StatusSource,
    params: WatchParams,
    mut on_running: Option<RunningHook>,
    cancel: &CancellationToken,
) -> Option<Result<StatusSnapshot, WatchFailure>> {
    let mut remaining_allowance = params.downtime_allowance;

    loop {
        let fault = match source.get_status().await {
            Ok(snapshot) => match snapshot.step_status(&params.step) {
                Ok(StepStatus::Passed) => return Some(Ok(snapshot)),
                Ok(StepStatus::Failed) => {
                    return Some(Err(WatchFailure::StepFailed {
                        step: params.step,
                        snapshot,
                    }));
                }
                Ok(status @ (StepStatus::Pending | StepStatus::Running)) => {
                    debug!(step = %params.step, status = %status, "Step not finished yet");
                    if let Some(hook) = on_running.as_mut() {
                        hook(&snapshot);
                    }
                    None
                }
                // Missing step key: a backend contract violation, accounted
                // like any other bad fetch.
                Err(err) => Some(err),
            },
            Err(err) => Some(err),
        };

        if let Some(err) = fault {
            if remaining_allowance.is_zero() {
                return Some(Err(WatchFailure::SourceUnavailable {
                    step: params.step,
                    source: err,
                }));
            }
            // Tick-counted budget: consume the nominal interval, not the
            // actual elapsed time.
            remaining_allowance = remaining_allowance.saturating_sub(params.poll_interval);
            warn!(
                step = %params.step,
                error = %err,
                remaining_allowance_ms = remaining_allowance.as_millis() as u64,
                "Status fetch failed, tolerating within downtime allowance"
            );
        }

        tokio::select! {
            () = cancel.cancelled() => return None,
            () = sleep(params.poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StepState;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INTERVAL: Duration = Duration::from_secs(1);

    fn snapshot(entries: &[(&str, StepStatus)]) -> StatusSnapshot {
        StatusSnapshot {
            current_step: entries.first().map(|(step, _)| (*step).to_string()),
            current_substep: None,
            current_node: None,
            steps: entries
                .iter()
                .map(|(step, status)| ((*step).to_string(), StepState { status: *status }))
                .collect(),
        }
    }

    fn unavailable() -> PuwError {
        PuwError::Endpoint {
            status: 503,
            details: "admin server restarting".to_string(),
        }
    }

    #[derive(Clone)]
    enum Reply {
        Status(StatusSnapshot),
        Unavailable,
    }

    /// Replays a scripted sequence of fetch results, repeating the final
    /// entry once the script is exhausted.
    struct ScriptedSource {
        script: Mutex<VecDeque<Reply>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            assert!(!replies.is_empty());
            Arc::new(Self {
                script: Mutex::new(replies.into()),
                fetches: AtomicUsize::new(0),
            })
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn get_status(&self) -> Result<StatusSnapshot, PuwError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let reply = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().unwrap().clone()
                }
            };
            match reply {
                Reply::Status(snapshot) => Ok(snapshot),
                Reply::Unavailable => Err(unavailable()),
            }
        }
    }

    /// A fetch that never settles; used to exercise `abort`.
    struct StalledSource;

    #[async_trait]
    impl StatusSource for StalledSource {
        async fn get_status(&self) -> Result<StatusSnapshot, PuwError> {
            futures::future::pending().await
        }
    }

    /// Records which terminal callback fired and how many running ticks
    /// were observed.
    #[derive(Default)]
    struct Recorded {
        success: Mutex<Option<StatusSnapshot>>,
        failure: Mutex<Option<WatchFailure>>,
        running_ticks: AtomicUsize,
    }

    impl Recorded {
        fn callbacks(this: &Arc<Self>) -> WatchCallbacks {
            let on_success = Arc::clone(this);
            let on_failure = Arc::clone(this);
            let on_running = Arc::clone(this);
            WatchCallbacks::new(
                move |snapshot| {
                    let prev = on_success.success.lock().unwrap().replace(snapshot);
                    assert!(prev.is_none(), "on_success invoked twice");
                },
                move |failure| {
                    let prev = on_failure.failure.lock().unwrap().replace(failure);
                    assert!(prev.is_none(), "on_failure invoked twice");
                },
            )
            .on_running(move |_| {
                on_running.running_ticks.fetch_add(1, Ordering::SeqCst);
            })
        }

        fn succeeded(&self) -> bool {
            self.success.lock().unwrap().is_some()
        }

        fn failed(&self) -> bool {
            self.failure.lock().unwrap().is_some()
        }
    }

    fn running_then_passed(step: &str, running_ticks: usize) -> Vec<Reply> {
        let mut script = vec![Reply::Status(snapshot(&[(step, StepStatus::Running)])); running_ticks];
        script.push(Reply::Status(snapshot(&[(step, StepStatus::Passed)])));
        script
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_succeeds_after_running_ticks() {
        let source = ScriptedSource::new(running_then_passed("prepare", 2));
        let recorded = Arc::new(Recorded::default());

        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(
            WatchParams::new("prepare", INTERVAL),
            Recorded::callbacks(&recorded),
        );
        handle.wait().await;

        assert_eq!(recorded.running_ticks.load(Ordering::SeqCst), 2);
        assert!(recorded.succeeded());
        assert!(!recorded.failed());
        assert_eq!(source.fetch_count(), 3);

        let final_snapshot = recorded.success.lock().unwrap().take().unwrap();
        assert_eq!(
            final_snapshot.step_status("prepare").unwrap(),
            StepStatus::Passed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_short_circuits_polling() {
        let source = ScriptedSource::new(vec![Reply::Status(snapshot(&[(
            "prechecks",
            StepStatus::Passed,
        )]))]);
        let recorded = Arc::new(Recorded::default());

        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(
            WatchParams::new("prechecks", INTERVAL),
            Recorded::callbacks(&recorded),
        );
        handle.wait().await;

        assert!(recorded.succeeded());
        assert_eq!(source.fetch_count(), 1);

        // No tick may occur after termination.
        sleep(INTERVAL * 10).await;
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_failure_invokes_failure_callback() {
        let source = ScriptedSource::new(vec![
            Reply::Status(snapshot(&[("services", StepStatus::Running)])),
            Reply::Status(snapshot(&[("services", StepStatus::Failed)])),
        ]);
        let recorded = Arc::new(Recorded::default());

        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(
            WatchParams::new("services", INTERVAL),
            Recorded::callbacks(&recorded),
        );
        handle.wait().await;

        assert!(!recorded.succeeded());
        assert!(recorded.failed());
        assert_eq!(recorded.running_ticks.load(Ordering::SeqCst), 1);
        assert_eq!(source.fetch_count(), 2);

        let failure = recorded.failure.lock().unwrap().take().unwrap();
        assert!(matches!(
            failure,
            WatchFailure::StepFailed { ref step, .. } if step == "services"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_allowance_fails_on_first_fetch_failure() {
        let source = ScriptedSource::new(vec![Reply::Unavailable]);
        let recorded = Arc::new(Recorded::default());

        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(WatchParams::new("admin", INTERVAL), Recorded::callbacks(&recorded));
        handle.wait().await;

        assert!(recorded.failed());
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowance_exhausted_on_third_consecutive_failure() {
        let source = ScriptedSource::new(vec![Reply::Unavailable]);
        let recorded = Arc::new(Recorded::default());

        // Two tolerated failures, the third one exhausts the budget.
        let params =
            WatchParams::new("database", INTERVAL).with_downtime_allowance(INTERVAL * 2);
        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(params, Recorded::callbacks(&recorded));
        handle.wait().await;

        assert!(recorded.failed());
        assert!(!recorded.succeeded());
        assert_eq!(source.fetch_count(), 3);

        let failure = recorded.failure.lock().unwrap().take().unwrap();
        assert!(matches!(
            failure,
            WatchFailure::SourceUnavailable { ref step, .. } if step == "database"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowance_consumed_only_on_failure_ticks() {
        // One tolerated failure empties the allowance, but the following
        // successful fetch must still complete the watch.
        let source = ScriptedSource::new(vec![
            Reply::Unavailable,
            Reply::Status(snapshot(&[("nodes", StepStatus::Passed)])),
        ]);
        let recorded = Arc::new(Recorded::default());

        let params = WatchParams::new("nodes", INTERVAL).with_downtime_allowance(INTERVAL);
        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(params, Recorded::callbacks(&recorded));
        handle.wait().await;

        assert!(recorded.succeeded());
        assert!(!recorded.failed());
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_step_counts_as_fetch_failure() {
        let source = ScriptedSource::new(vec![Reply::Status(snapshot(&[(
            "prechecks",
            StepStatus::Passed,
        )]))]);
        let recorded = Arc::new(Recorded::default());

        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(
            WatchParams::new("backup_crowbar", INTERVAL),
            Recorded::callbacks(&recorded),
        );
        handle.wait().await;

        let failure = recorded.failure.lock().unwrap().take().unwrap();
        match failure {
            WatchFailure::SourceUnavailable { step, source } => {
                assert_eq!(step, "backup_crowbar");
                assert!(matches!(source, PuwError::MissingStep(_)));
            }
            other => panic!("expected SourceUnavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_suppresses_callbacks_and_further_ticks() {
        let source = ScriptedSource::new(vec![Reply::Status(snapshot(&[(
            "repocheck_nodes",
            StepStatus::Running,
        )]))]);
        let recorded = Arc::new(Recorded::default());

        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(
            WatchParams::new("repocheck_nodes", INTERVAL),
            Recorded::callbacks(&recorded),
        );

        // Let a few ticks happen, then stop mid-poll.
        sleep(INTERVAL * 3).await;
        handle.stop();
        handle.wait().await;

        assert!(!recorded.succeeded());
        assert!(!recorded.failed());

        let fetches_at_stop = source.fetch_count();
        assert!(fetches_at_stop >= 1);

        sleep(INTERVAL * 10).await;
        assert_eq!(source.fetch_count(), fetches_at_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_in_flight_fetch_discards_result() {
        // The fetch settles after stop(); its terminal outcome must be
        // discarded, not delivered.
        struct GatedSource {
            gate: tokio::sync::Notify,
        }

        #[async_trait]
        impl StatusSource for GatedSource {
            async fn get_status(&self) -> Result<StatusSnapshot, PuwError> {
                self.gate.notified().await;
                Ok(snapshot(&[("prepare", StepStatus::Passed)]))
            }
        }

        let source = Arc::new(GatedSource {
            gate: tokio::sync::Notify::new(),
        });
        let recorded = Arc::new(Recorded::default());

        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(
            WatchParams::new("prepare", INTERVAL),
            Recorded::callbacks(&recorded),
        );

        // Let the watch task start its fetch before stopping it.
        tokio::task::yield_now().await;
        handle.stop();
        source.gate.notify_one();
        handle.wait().await;

        assert!(!recorded.succeeded());
        assert!(!recorded.failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_drops_in_flight_fetch() {
        let recorded = Arc::new(Recorded::default());

        let watcher = StepWatcher::new(Arc::new(StalledSource) as Arc<dyn StatusSource>);
        let handle = watcher.watch_step(
            WatchParams::new("prepare", INTERVAL),
            Recorded::callbacks(&recorded),
        );

        tokio::task::yield_now().await;
        handle.abort();
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        handle.wait().await;

        assert!(!recorded.succeeded());
        assert!(!recorded.failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_step_returns_final_snapshot() {
        let source = ScriptedSource::new(running_then_passed("admin", 1));

        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let snapshot = watcher
            .wait_for_step(WatchParams::new("admin", INTERVAL), None)
            .await
            .unwrap();

        assert_eq!(snapshot.step_status("admin").unwrap(), StepStatus::Passed);
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_step_surfaces_step_failure() {
        let source = ScriptedSource::new(vec![Reply::Status(snapshot(&[(
            "backup_openstack",
            StepStatus::Failed,
        )]))]);

        let watcher = StepWatcher::new(Arc::clone(&source) as Arc<dyn StatusSource>);
        let err = watcher
            .wait_for_step(WatchParams::new("backup_openstack", INTERVAL), None)
            .await
            .unwrap_err();

        assert!(matches!(err, WatchFailure::StepFailed { .. }));
    }
}
