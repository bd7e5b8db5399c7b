//! Governor - admission, accounting and the kill switch in one place.
//!
//! # Responsibilities
//! 1. Admit runs (shutdown, concurrency, then budget)
//! 2. Price and record usage reports, re-evaluating the tier after each
//! 3. Re-check every session on a periodic tick
//! 4. Abort runs, sessions, or everything (emergency kill)
//! 5. Publish every transition on the event channel
//!
//! The governor is built once with [`Governor::new`] and shared by cloning
//! the handle. Background tasks hold only a weak reference and stop on
//! [`Governor::shutdown`] or when the last handle is dropped.

mod tasks;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::budget::{
    Admission, BudgetLimits, BudgetPolicy, BudgetState, CostLedger, DenyReason,
    OverrunProjection, PricingTable, SpendTotals, StatusTier, UsageEntry, UsageOutcome,
    UsageScope,
};
use crate::config::{ConfigError, GovernorConfig};
use crate::events::{EventBus, EventListener, EventPayload, GovernorEvent, Subscription};
use crate::runs::{Run, RunHandle, RunId, RunRegistry, RunStatus, StartRunError};

/// Reason used when the exceeded tier trips the kill switch.
pub const BUDGET_EXCEEDED_REASON: &str = "budget exceeded";

/// Outcome of an emergency kill.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillReport {
    pub reason: String,
    /// Runs active when the kill started.
    pub signalled: usize,
    /// Runs that ended on their own within the grace period.
    pub drained: usize,
    /// Runs removed after the grace period elapsed.
    pub forced: usize,
    pub elapsed_ms: u64,
}

struct Inner {
    config: GovernorConfig,
    ledger: CostLedger,
    policy: BudgetPolicy,
    registry: RunRegistry,
    events: EventBus,
    kill_tx: mpsc::UnboundedSender<String>,
    lifecycle: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.lifecycle.cancel();
    }
}

/// Shared handle to the governor.
#[derive(Clone)]
pub struct Governor {
    inner: Arc<Inner>,
}

impl Governor {
    /// Build a governor and start its ticker and kill-switch tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: GovernorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let pricing = PricingTable::from_config(&config.pricing);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            ledger: CostLedger::new(pricing, config.history_capacity),
            policy: BudgetPolicy::new(
                config.limits.clone(),
                config.overrun_window,
                config.overrun_lookahead,
            ),
            registry: RunRegistry::new(config.max_concurrent_runs),
            events: EventBus::default(),
            kill_tx,
            lifecycle: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let ticker = tasks::spawn_ticker(
            Arc::downgrade(&inner),
            inner.config.budget_check_interval(),
            inner.lifecycle.clone(),
        );
        let kill_switch =
            tasks::spawn_kill_switch(Arc::downgrade(&inner), kill_rx, inner.lifecycle.clone());
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([ticker, kill_switch]);

        tracing::info!(
            session_cap = inner.config.limits.session_cap,
            max_concurrent_runs = inner.config.max_concurrent_runs,
            check_interval_ms = inner.config.budget_check_interval_ms,
            shutdown_timeout_ms = inner.config.graceful_shutdown_timeout_ms,
            "Governor started"
        );

        Ok(Self { inner })
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    // ---------------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------------

    /// Admit and register a run.
    ///
    /// Fails with `ShuttingDown`, `Capacity`, or `BudgetDenied`, checked in that order.
    pub async fn start_run<I, S>(
        &self,
        session_id: &str,
        participants: I,
    ) -> Result<RunHandle, StartRunError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let participants: BTreeSet<String> = participants.into_iter().map(Into::into).collect();
        let budget = match self.inner.ledger.tier(session_id).await {
            StatusTier::Exceeded => Admission::Deny(DenyReason::BudgetExceeded),
            _ => Admission::Allow,
        };

        let run = match self
            .inner
            .registry
            .register(session_id, participants, budget)
            .await
        {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Run refused");
                return Err(e);
            }
        };
        self.inner.ledger.open_session(session_id).await;

        tracing::info!(
            session_id = %session_id,
            run_id = %run.id,
            participants = run.participants.len(),
            "Run started"
        );
        self.publish(
            Some(session_id),
            EventPayload::Created {
                run_id: run.id,
                participants: run.participants.iter().cloned().collect(),
            },
        );
        Ok(run.handle())
    }

    /// Mark a run ended. Unknown or already-finished ids are ignored.
    pub async fn end_run(&self, run_id: RunId) -> bool {
        let Some(run) = self.inner.registry.remove(&run_id, RunStatus::Ended).await else {
            return false;
        };
        tracing::info!(session_id = %run.session_id, run_id = %run_id, "Run ended");
        self.publish(Some(&run.session_id), EventPayload::Ended { run_id });
        true
    }

    /// Cancel and remove a run. Unknown or already-finished ids are ignored.
    pub async fn abort_run(&self, run_id: RunId, reason: &str) -> bool {
        let Some(run) = self.inner.registry.remove(&run_id, RunStatus::Aborted).await else {
            return false;
        };
        tracing::info!(
            session_id = %run.session_id,
            run_id = %run_id,
            reason = %reason,
            "Run aborted"
        );
        self.publish_aborted(&run, reason, false);
        true
    }

    /// Abort every active run of one session. Returns how many were aborted.
    pub async fn abort_session(&self, session_id: &str, reason: &str) -> usize {
        let aborted = self.inner.registry.abort_session(session_id).await;
        if !aborted.is_empty() {
            tracing::info!(
                session_id = %session_id,
                aborted = aborted.len(),
                reason = %reason,
                "Session aborted"
            );
        }
        for run in &aborted {
            self.publish_aborted(run, reason, false);
        }
        aborted.len()
    }

    /// Stop everything: refuse new runs, cancel all active runs, give them
    /// `graceful_shutdown_timeout_ms` to end, then remove the rest.
    ///
    /// Returns within the grace period (plus lock acquisition). New runs are
    /// refused until [`Governor::resume`].
    pub async fn emergency_kill(&self, reason: &str) -> KillReport {
        let started = tokio::time::Instant::now();
        let signalled = self.inner.registry.begin_shutdown().await;
        tracing::warn!(
            reason = %reason,
            active_runs = signalled.len(),
            "Emergency kill engaged"
        );
        self.publish(
            None,
            EventPayload::Killed {
                reason: reason.to_string(),
                active_runs: signalled.len(),
            },
        );

        // Runs admitted after a concurrent `resume` are not part of this kill
        let signalled_ids: Vec<RunId> = signalled.iter().map(|r| r.id).collect();
        let grace = self.inner.config.graceful_shutdown_timeout();
        let forced = if self.inner.registry.wait_drained(&signalled_ids, grace).await {
            Vec::new()
        } else {
            self.inner.registry.force_clear(&signalled_ids).await
        };

        let forced_reason = format!("{} (grace period elapsed)", reason);
        for run in &forced {
            tracing::warn!(
                session_id = %run.session_id,
                run_id = %run.id,
                "Run force-removed after grace period"
            );
            self.publish_aborted(run, &forced_reason, true);
        }

        let report = KillReport {
            reason: reason.to_string(),
            signalled: signalled.len(),
            drained: signalled.len().saturating_sub(forced.len()),
            forced: forced.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::warn!(
            signalled = report.signalled,
            drained = report.drained,
            forced = report.forced,
            elapsed_ms = report.elapsed_ms,
            "Emergency kill complete"
        );
        report
    }

    /// Accept runs again after an emergency kill.
    pub async fn resume(&self) -> bool {
        let resumed = self.inner.registry.resume().await;
        if resumed {
            tracing::info!("Governor resumed, accepting runs");
        }
        resumed
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.registry.is_shutting_down().await
    }

    pub async fn is_run_active(&self, run_id: RunId) -> bool {
        self.inner.registry.is_active(&run_id).await
    }

    pub async fn run(&self, run_id: RunId) -> Option<Run> {
        self.inner.registry.get(&run_id).await
    }

    /// Handle for an active run, e.g. for a worker other than the starter.
    pub async fn run_handle(&self, run_id: RunId) -> Option<RunHandle> {
        self.run(run_id).await.map(|run| run.handle())
    }

    pub async fn active_runs(&self) -> Vec<Run> {
        self.inner.registry.active_runs().await
    }

    pub async fn session_runs(&self, session_id: &str) -> Vec<Run> {
        self.inner.registry.session_runs(session_id).await
    }

    // ---------------------------------------------------------------------
    // Budget
    // ---------------------------------------------------------------------

    /// Price and record a usage report.
    ///
    /// Crossing the exceeded tier trips the kill switch asynchronously; the
    /// caller only ever sees `Accepted` or `Denied`.
    pub async fn record_usage(
        &self,
        session_id: &str,
        scope: &UsageScope,
        input_units: u64,
        output_units: u64,
    ) -> UsageOutcome {
        let limits = self.inner.policy.limits().await;
        let outcome = self
            .inner
            .ledger
            .record_usage(session_id, scope, input_units, output_units, &limits)
            .await;

        match &outcome {
            UsageOutcome::Accepted {
                entry,
                totals,
                crossed,
            } => {
                tracing::debug!(
                    session_id = %session_id,
                    provider = %scope.provider,
                    model = %scope.model,
                    cost = entry.cost,
                    total = totals.total,
                    "Usage recorded"
                );
                self.signal_tiers(session_id, totals.total, crossed, &limits);
            }
            UsageOutcome::Denied { reason, cost } => {
                tracing::warn!(
                    session_id = %session_id,
                    provider = %scope.provider,
                    model = %scope.model,
                    cost = *cost,
                    reason = %reason,
                    "Usage denied"
                );
            }
        }
        outcome
    }

    /// Check whether a projected cost would fit, without recording anything.
    pub async fn evaluate_admission(
        &self,
        session_id: &str,
        scope: &UsageScope,
        projected_cost: f64,
    ) -> Admission {
        let limits = self.inner.policy.limits().await;
        match self.inner.ledger.query_state(session_id).await {
            Some(state) => limits.evaluate_admission(&state.totals, scope, projected_cost),
            None => limits.evaluate_admission(&SpendTotals::default(), scope, projected_cost),
        }
    }

    pub async fn budget_state(&self, session_id: &str) -> Option<BudgetState> {
        self.inner.ledger.query_state(session_id).await
    }

    pub async fn recent_entries(&self, session_id: &str, n: usize) -> Vec<UsageEntry> {
        self.inner.ledger.recent_entries(session_id, n).await
    }

    /// Advisory projection; never affects admission.
    pub async fn project_overrun(&self, session_id: &str) -> Option<OverrunProjection> {
        let state = self.inner.ledger.query_state(session_id).await?;
        Some(self.inner.policy.project_overrun(&state).await)
    }

    /// Create a session's budget state ahead of its first report.
    pub async fn open_session(&self, session_id: &str) -> bool {
        self.inner.ledger.open_session(session_id).await
    }

    pub async fn sessions(&self) -> Vec<String> {
        self.inner.ledger.sessions().await
    }

    /// Zero a session's spend and re-arm its tier events.
    pub async fn reset_session(&self, session_id: &str) -> bool {
        let Some(previous_total) = self.inner.ledger.reset(session_id).await else {
            return false;
        };
        tracing::info!(session_id = %session_id, previous_total, "Session budget reset");
        self.publish(Some(session_id), EventPayload::Reset { previous_total });
        true
    }

    pub async fn limits(&self) -> Arc<BudgetLimits> {
        self.inner.policy.limits().await
    }

    /// Replace caps at runtime. The next tick applies them to stored tiers.
    pub async fn update_limits(&self, limits: BudgetLimits) -> Result<(), ConfigError> {
        self.inner.policy.update_limits(limits).await
    }

    /// Re-evaluate every session now. Returns the number of tier events emitted.
    pub async fn recheck_now(&self) -> usize {
        let limits = self.inner.policy.limits().await;
        let mut emitted = 0;
        for result in self.inner.ledger.reevaluate_all(&limits).await {
            emitted += result.crossed.len();
            self.signal_tiers(&result.session_id, result.total, &result.crossed, &limits);

            if result.crossed.is_empty() {
                if let Some(state) = self.inner.ledger.query_state(&result.session_id).await {
                    let projection = self.inner.policy.project_overrun(&state).await;
                    if projection.will_exceed && state.tier() < StatusTier::Exceeded {
                        tracing::warn!(
                            session_id = %result.session_id,
                            average_cost = projection.average_cost,
                            projected_total = projection.projected_total,
                            calls_remaining = ?projection.calls_remaining,
                            "Session projected to exceed its cap"
                        );
                    }
                }
            }
        }
        tracing::debug!(emitted, "Budget re-check complete");
        emitted
    }

    // ---------------------------------------------------------------------
    // Events and lifecycle
    // ---------------------------------------------------------------------

    /// Register a listener. Dropping the returned handle unsubscribes it.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> Subscription {
        self.inner.events.subscribe_listener(listener)
    }

    /// Raw event receiver. `None` after shutdown.
    pub fn events(&self) -> Option<broadcast::Receiver<GovernorEvent>> {
        self.inner.events.subscribe()
    }

    /// Stop background tasks and close the event channel.
    ///
    /// Active runs are left alone; call [`Governor::emergency_kill`] first to
    /// stop them.
    pub async fn shutdown(&self) {
        self.inner.lifecycle.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Governor task failed");
            }
        }
        self.inner.events.close();
        tracing::info!("Governor stopped");
    }

    fn publish(&self, session_id: Option<&str>, payload: EventPayload) {
        self.inner
            .events
            .publish(GovernorEvent::new(session_id, payload));
    }

    fn publish_aborted(&self, run: &Run, reason: &str, forced: bool) {
        self.publish(
            Some(&run.session_id),
            EventPayload::Aborted {
                run_id: run.id,
                reason: reason.to_string(),
                forced,
            },
        );
    }

    /// Publish newly crossed tiers; `exceeded` also trips the kill switch.
    fn signal_tiers(
        &self,
        session_id: &str,
        total_spent: f64,
        crossed: &[StatusTier],
        limits: &BudgetLimits,
    ) {
        let session_cap = limits.session_cap;
        for tier in crossed {
            let payload = match tier {
                StatusTier::Healthy => continue,
                StatusTier::Warning => EventPayload::Warning {
                    total_spent,
                    session_cap,
                },
                StatusTier::Critical => EventPayload::Critical {
                    total_spent,
                    session_cap,
                },
                StatusTier::Exceeded => EventPayload::Exceeded {
                    total_spent,
                    session_cap,
                },
            };
            tracing::warn!(
                session_id = %session_id,
                tier = %tier,
                total_spent,
                session_cap,
                "Budget tier crossed"
            );
            self.publish(Some(session_id), payload);

            if *tier != StatusTier::Exceeded {
                continue;
            }
            if self.inner.lifecycle.is_cancelled() {
                tracing::debug!(session_id = %session_id, "Governor stopped, no budget kill");
            } else if self
                .inner
                .kill_tx
                .send(BUDGET_EXCEEDED_REASON.to_string())
                .is_err()
            {
                tracing::error!(session_id = %session_id, "Kill switch task is not running");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::broadcast::error::RecvError;

    use crate::budget::{ModelRate, PricingConfig};
    use crate::events::EventKind;

    /// $1 per 1000 input units, output free, so costs are easy to read.
    fn config(session_cap: f64) -> GovernorConfig {
        GovernorConfig {
            limits: BudgetLimits {
                session_cap,
                ..Default::default()
            },
            max_concurrent_runs: 4,
            budget_check_interval_ms: 1_000,
            graceful_shutdown_timeout_ms: 100,
            pricing: PricingConfig {
                fallback: ModelRate::new(1.0, 0.0),
                rates: Vec::new(),
            },
            ..Default::default()
        }
    }

    fn scope() -> UsageScope {
        UsageScope::new("anthropic", "sonnet")
    }

    async fn next_of(
        rx: &mut broadcast::Receiver<GovernorEvent>,
        kind: EventKind,
    ) -> GovernorEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if event.kind() == kind {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exceeded_trips_kill_switch() {
        let governor = Governor::new(config(4.0)).unwrap();
        let mut rx = governor.events().unwrap();
        let run = governor.start_run("s1", ["writer"]).await.unwrap();

        let outcome = governor.record_usage("s1", &scope(), 4_000, 0).await;
        assert!(outcome.is_accepted());

        let killed = next_of(&mut rx, EventKind::Killed).await;
        assert_eq!(
            killed.payload,
            EventPayload::Killed {
                reason: BUDGET_EXCEEDED_REASON.to_string(),
                active_runs: 1
            }
        );
        assert!(run.is_cancelled());

        // The run never ends itself, so it is removed after the grace period
        let aborted = next_of(&mut rx, EventKind::Aborted).await;
        assert!(matches!(aborted.payload, EventPayload::Aborted { forced: true, .. }));
        assert!(governor.active_runs().await.is_empty());

        let err = governor.start_run("s2", ["writer"]).await.unwrap_err();
        assert_eq!(err, StartRunError::ShuttingDown);

        // After resuming, the exceeded session stays closed but others may start
        assert!(governor.resume().await);
        let err = governor.start_run("s1", ["writer"]).await.unwrap_err();
        assert_eq!(err, StartRunError::BudgetDenied(DenyReason::BudgetExceeded));
        assert!(governor.start_run("s2", ["writer"]).await.is_ok());

        governor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_applies_lowered_cap() {
        let governor = Governor::new(config(10.0)).unwrap();
        let mut rx = governor.events().unwrap();

        governor.record_usage("s1", &scope(), 5_000, 0).await;
        assert_eq!(governor.budget_state("s1").await.unwrap().tier(), StatusTier::Healthy);

        governor
            .update_limits(BudgetLimits {
                session_cap: 6.0,
                ..Default::default()
            })
            .await
            .unwrap();

        let warning = next_of(&mut rx, EventKind::Warning).await;
        assert_eq!(warning.session_id.as_deref(), Some("s1"));
        assert_eq!(
            warning.payload,
            EventPayload::Warning {
                total_spent: 5.0,
                session_cap: 6.0
            }
        );
        assert_eq!(governor.budget_state("s1").await.unwrap().tier(), StatusTier::Warning);

        // Already issued, so a manual re-check finds nothing new
        assert_eq!(governor.recheck_now().await, 0);
        governor.shutdown().await;
    }

    #[tokio::test]
    async fn test_jump_reports_every_tier_once() {
        let governor = Governor::new(config(10.0)).unwrap();
        let mut rx = governor.events().unwrap();

        governor.record_usage("s1", &scope(), 9_500, 0).await;
        governor.record_usage("s1", &scope(), 100, 0).await;

        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec![EventKind::Warning, EventKind::Critical]);
        governor.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_rearms_tier_events() {
        let governor = Governor::new(config(10.0)).unwrap();
        governor.record_usage("s1", &scope(), 7_500, 0).await;
        assert!(governor.reset_session("s1").await);
        assert!(!governor.reset_session("unknown").await);

        let state = governor.budget_state("s1").await.unwrap();
        assert_eq!(state.total_spent(), 0.0);
        assert_eq!(state.tier(), StatusTier::Healthy);

        let mut rx = governor.events().unwrap();
        governor.record_usage("s1", &scope(), 7_500, 0).await;
        assert_eq!(rx.try_recv().unwrap().kind(), EventKind::Warning);
        governor.shutdown().await;
    }

    #[tokio::test]
    async fn test_abort_session_publishes_per_run() {
        let governor = Governor::new(config(10.0)).unwrap();
        let a1 = governor.start_run("a", ["w"]).await.unwrap();
        let a2 = governor.start_run("a", ["w"]).await.unwrap();
        let b1 = governor.start_run("b", ["w"]).await.unwrap();
        let mut rx = governor.events().unwrap();

        assert_eq!(governor.abort_session("a", "operator").await, 2);
        assert!(a1.is_cancelled() && a2.is_cancelled());
        assert!(!b1.is_cancelled());
        assert!(governor.is_run_active(b1.id()).await);

        for _ in 0..2 {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.kind(), EventKind::Aborted);
            assert_eq!(event.session_id.as_deref(), Some("a"));
        }

        // Ending or aborting a finished run is a no-op
        assert!(!governor.end_run(a1.id()).await);
        assert!(!governor.abort_run(a2.id(), "again").await);
        assert!(rx.try_recv().is_err());
        governor.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_events_after_shutdown() {
        let governor = Governor::new(config(10.0)).unwrap();
        let mut rx = governor.events().unwrap();
        governor.start_run("s1", ["w"]).await.unwrap();

        governor.shutdown().await;
        assert!(governor.events().is_none());

        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::Created);
        governor.record_usage("s1", &scope(), 9_000, 0).await;
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_during_kill_spares_new_runs() {
        let governor = Governor::new(GovernorConfig {
            graceful_shutdown_timeout_ms: 200,
            ..config(10.0)
        })
        .unwrap();
        let stuck = governor.start_run("s1", ["w"]).await.unwrap();

        let (report, fresh) = tokio::join!(governor.emergency_kill("operator"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(governor.resume().await);
            governor.start_run("s2", ["w"]).await.unwrap()
        });

        assert_eq!(report.signalled, 1);
        assert_eq!(report.forced, 1);
        assert!(!governor.is_run_active(stuck.id()).await);
        assert!(governor.is_run_active(fresh.id()).await);
        assert!(!fresh.is_cancelled());
        governor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_stops_background_work() {
        let governor = Governor::new(config(10.0)).unwrap();
        let other = governor.clone();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = governor.subscribe(Arc::new(crate::events::listener_fn(
            "recorder",
            move |event: &GovernorEvent| {
                sink.lock().unwrap().push(event.kind());
                Ok(())
            },
        )));
        governor.record_usage("s1", &scope(), 7_500, 0).await;

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *governor.inner.tasks.lock().unwrap());
        assert_eq!(handles.len(), 2);
        drop(governor);
        drop(other);

        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::time::timeout(Duration::from_secs(1), subscription.closed())
            .await
            .expect("event channel should close with the governor");
        for handle in handles {
            assert!(handle.is_finished());
            handle.await.unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Warning]);
    }

    #[tokio::test]
    async fn test_exceeded_after_shutdown_does_not_kill() {
        let governor = Governor::new(config(4.0)).unwrap();
        let run = governor.start_run("s1", ["w"]).await.unwrap();
        governor.shutdown().await;

        let outcome = governor.record_usage("s1", &scope(), 4_000, 0).await;
        assert!(outcome.is_accepted());
        assert_eq!(governor.budget_state("s1").await.unwrap().tier(), StatusTier::Exceeded);
        assert!(!governor.is_shutting_down().await);
        assert!(!run.is_cancelled());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = Governor::new(GovernorConfig {
            max_concurrent_runs: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(ConfigError::InvalidConcurrency)));
    }
}
