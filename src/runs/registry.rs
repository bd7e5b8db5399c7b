//! Run registry - the set of active runs and the concurrency limit.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use super::{Run, RunId, RunStatus};
use crate::budget::{Admission, DenyReason};

/// Why a run could not be started.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StartRunError {
    #[error("Governor is shutting down")]
    ShuttingDown,

    #[error("Concurrency limit reached ({active}/{limit} runs active)")]
    Capacity { active: usize, limit: usize },

    #[error("Budget denied: {0}")]
    BudgetDenied(DenyReason),
}

struct RegistryState {
    runs: HashMap<RunId, Run>,
    session_tokens: HashMap<String, CancellationToken>,
    root: CancellationToken,
    shutting_down: bool,
}

impl RegistryState {
    /// Remove a run, marking it with its terminal status in the same step.
    fn take(&mut self, run_id: &RunId, status: RunStatus) -> Option<Run> {
        let mut run = self.runs.remove(run_id)?;
        if status == RunStatus::Aborted {
            run.signal();
        }
        run.status = status;
        if !self.runs.values().any(|r| r.session_id == run.session_id) {
            self.session_tokens.remove(&run.session_id);
        }
        Some(run)
    }
}

/// Tracks active runs, enforces `max_concurrent`, and owns the cancellation tree.
pub struct RunRegistry {
    max_concurrent: usize,
    state: RwLock<RegistryState>,
    active: watch::Sender<usize>,
}

impl RunRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            max_concurrent,
            state: RwLock::new(RegistryState {
                runs: HashMap::new(),
                session_tokens: HashMap::new(),
                root: CancellationToken::new(),
                shutting_down: false,
            }),
            active,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn publish_count(&self, state: &RegistryState) {
        self.active.send_replace(state.runs.len());
    }

    /// Register a new run.
    ///
    /// Checks run in order: shutting down, capacity, then `budget`.
    pub async fn register(
        &self,
        session_id: &str,
        participants: BTreeSet<String>,
        budget: Admission,
    ) -> Result<Run, StartRunError> {
        let mut state = self.state.write().await;
        if state.shutting_down {
            return Err(StartRunError::ShuttingDown);
        }
        if state.runs.len() >= self.max_concurrent {
            return Err(StartRunError::Capacity {
                active: state.runs.len(),
                limit: self.max_concurrent,
            });
        }
        if let Admission::Deny(reason) = budget {
            return Err(StartRunError::BudgetDenied(reason));
        }

        let root = state.root.clone();
        let session_token = state
            .session_tokens
            .entry(session_id.to_string())
            .or_insert_with(|| root.child_token())
            .child_token();
        let run = Run::new(session_id, participants, session_token);
        state.runs.insert(run.id, run.clone());
        self.publish_count(&state);
        Ok(run)
    }

    /// Remove a run with the given terminal status. `None` for unknown ids.
    ///
    /// `Aborted` also signals the run's token.
    pub async fn remove(&self, run_id: &RunId, status: RunStatus) -> Option<Run> {
        let mut state = self.state.write().await;
        let run = state.take(run_id, status)?;
        self.publish_count(&state);
        Some(run)
    }

    /// Cancel a session's token and remove all of its runs as aborted.
    pub async fn abort_session(&self, session_id: &str) -> Vec<Run> {
        let mut state = self.state.write().await;
        if let Some(token) = state.session_tokens.get(session_id) {
            token.cancel();
        }
        let ids: Vec<RunId> = state
            .runs
            .values()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.id)
            .collect();
        let aborted: Vec<Run> = ids
            .iter()
            .filter_map(|id| state.take(id, RunStatus::Aborted))
            .collect();
        state.session_tokens.remove(session_id);
        self.publish_count(&state);
        aborted
    }

    /// Refuse new runs and cancel the root token. Returns the runs signalled.
    pub async fn begin_shutdown(&self) -> Vec<Run> {
        let mut state = self.state.write().await;
        state.shutting_down = true;
        state.root.cancel();
        state.runs.values().cloned().collect()
    }

    /// Wait until none of `run_ids` is active, up to `timeout`. `true` if drained.
    ///
    /// Runs registered after a `resume` are not waited for.
    pub async fn wait_drained(&self, run_ids: &[RunId], timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        let drained = async {
            loop {
                {
                    let state = self.state.read().await;
                    if run_ids.iter().all(|id| !state.runs.contains_key(id)) {
                        return true;
                    }
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, drained)
            .await
            .unwrap_or(false)
    }

    /// Remove the given runs as aborted, skipping any that already ended.
    pub async fn force_clear(&self, run_ids: &[RunId]) -> Vec<Run> {
        let mut state = self.state.write().await;
        let removed: Vec<Run> = run_ids
            .iter()
            .filter_map(|id| state.take(id, RunStatus::Aborted))
            .collect();
        self.publish_count(&state);
        removed
    }

    /// Accept new runs again after a shutdown. `false` if not shut down.
    pub async fn resume(&self) -> bool {
        let mut state = self.state.write().await;
        if !state.shutting_down {
            return false;
        }
        state.shutting_down = false;
        state.root = CancellationToken::new();
        state.session_tokens.clear();
        true
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.state.read().await.shutting_down
    }

    pub async fn is_active(&self, run_id: &RunId) -> bool {
        self.state.read().await.runs.contains_key(run_id)
    }

    pub async fn get(&self, run_id: &RunId) -> Option<Run> {
        self.state.read().await.runs.get(run_id).cloned()
    }

    /// Active runs, oldest first.
    pub async fn active_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.state.read().await.runs.values().cloned().collect();
        runs.sort_by_key(|r| (r.started_at, r.id));
        runs
    }

    pub async fn session_runs(&self, session_id: &str) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .state
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| (r.started_at, r.id));
        runs
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.runs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn nobody() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = RunRegistry::new(2);
        let a = assert_ok!(registry.register("s1", nobody(), Admission::Allow).await);
        assert_ok!(registry.register("s1", nobody(), Admission::Allow).await);

        let err = assert_err!(registry.register("s2", nobody(), Admission::Allow).await);
        assert_eq!(err, StartRunError::Capacity { active: 2, limit: 2 });

        let ended = registry.remove(&a.id, RunStatus::Ended).await.unwrap();
        assert_eq!(ended.status, RunStatus::Ended);
        assert!(!ended.is_cancel_requested());
        assert_ok!(registry.register("s2", nobody(), Admission::Allow).await);
    }

    #[tokio::test]
    async fn test_check_order() {
        let registry = RunRegistry::new(1);
        registry.register("s1", nobody(), Admission::Allow).await.unwrap();

        // Full registry reports capacity before budget
        let err = registry
            .register("s1", nobody(), Admission::Deny(DenyReason::BudgetExceeded))
            .await
            .unwrap_err();
        assert!(matches!(err, StartRunError::Capacity { .. }));

        // Shutdown is reported before capacity
        registry.begin_shutdown().await;
        let err = registry
            .register("s1", nobody(), Admission::Allow)
            .await
            .unwrap_err();
        assert_eq!(err, StartRunError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_budget_denial() {
        let registry = RunRegistry::new(4);
        let err = registry
            .register("s1", nobody(), Admission::Deny(DenyReason::BudgetExceeded))
            .await
            .unwrap_err();
        assert_eq!(err, StartRunError::BudgetDenied(DenyReason::BudgetExceeded));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_none() {
        let registry = RunRegistry::new(1);
        let run = registry.register("s1", nobody(), Admission::Allow).await.unwrap();
        assert!(registry.remove(&run.id, RunStatus::Aborted).await.is_some());
        assert!(registry.remove(&run.id, RunStatus::Aborted).await.is_none());
        assert!(registry.remove(&RunId::new(), RunStatus::Ended).await.is_none());
        assert!(run.is_cancel_requested());
    }

    #[tokio::test]
    async fn test_abort_session_leaves_other_sessions() {
        let registry = RunRegistry::new(8);
        let a1 = registry.register("a", nobody(), Admission::Allow).await.unwrap();
        let a2 = registry.register("a", nobody(), Admission::Allow).await.unwrap();
        let b1 = registry.register("b", nobody(), Admission::Allow).await.unwrap();

        let aborted = registry.abort_session("a").await;
        assert_eq!(aborted.len(), 2);
        assert!(aborted.iter().all(|r| r.status == RunStatus::Aborted));
        assert!(a1.is_cancel_requested());
        assert!(a2.is_cancel_requested());

        assert!(!b1.is_cancel_requested());
        assert!(registry.is_active(&b1.id).await);
        assert_eq!(registry.len().await, 1);

        // New runs in the aborted session get a fresh, uncancelled token
        let a3 = registry.register("a", nobody(), Admission::Allow).await.unwrap();
        assert!(!a3.is_cancel_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_drained_times_out() {
        let registry = RunRegistry::new(2);
        registry.register("s1", nobody(), Admission::Allow).await.unwrap();

        let signalled = registry.begin_shutdown().await;
        assert_eq!(signalled.len(), 1);
        assert!(signalled[0].is_cancel_requested());

        let ids: Vec<RunId> = signalled.iter().map(|r| r.id).collect();
        assert!(!registry.wait_drained(&ids, Duration::from_millis(100)).await);
        let forced = registry.force_clear(&ids).await;
        assert_eq!(forced.len(), 1);
        assert!(registry.wait_drained(&ids, Duration::from_millis(100)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_started_after_resume_survive_the_kill() {
        let registry = RunRegistry::new(4);
        let stuck = registry.register("s1", nobody(), Admission::Allow).await.unwrap();
        let ids: Vec<RunId> = registry
            .begin_shutdown()
            .await
            .iter()
            .map(|r| r.id)
            .collect();

        assert!(registry.resume().await);
        let fresh = assert_ok!(registry.register("s2", nobody(), Admission::Allow).await);

        assert!(!registry.wait_drained(&ids, Duration::from_millis(200)).await);
        let forced = registry.force_clear(&ids).await;
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].id, stuck.id);

        assert!(registry.is_active(&fresh.id).await);
        assert!(!fresh.is_cancel_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_drained_ignores_unrelated_runs() {
        let registry = RunRegistry::new(4);
        let a = registry.register("s1", nobody(), Admission::Allow).await.unwrap();
        registry.register("s2", nobody(), Admission::Allow).await.unwrap();

        registry.remove(&a.id, RunStatus::Ended).await;
        assert!(registry.wait_drained(&[a.id], Duration::from_millis(10)).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_resume_after_shutdown() {
        let registry = RunRegistry::new(2);
        assert!(!registry.resume().await);

        registry.begin_shutdown().await;
        assert!(registry.is_shutting_down().await);
        assert!(registry.resume().await);

        let run = registry.register("s1", nobody(), Admission::Allow).await.unwrap();
        assert!(!run.is_cancel_requested());
    }

    #[tokio::test]
    async fn test_session_runs_filter() {
        let registry = RunRegistry::new(4);
        registry.register("a", nobody(), Admission::Allow).await.unwrap();
        registry.register("b", nobody(), Admission::Allow).await.unwrap();
        registry.register("a", nobody(), Admission::Allow).await.unwrap();

        assert_eq!(registry.session_runs("a").await.len(), 2);
        assert_eq!(registry.session_runs("c").await.len(), 0);
        assert_eq!(registry.active_runs().await.len(), 3);
    }
}
