//! Runs - concurrently executing, cancellable units of metered work.
//!
//! # Cancellation tree
//! ```text
//! root token (emergency kill)
//!   └── session token (abort_session)
//!         └── run token (abort_run)
//! ```
//! Cancelling a node cancels everything below it. Work observes cancellation
//! at its own suspension points through [`RunHandle`].

mod registry;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

pub use registry::{RunRegistry, StartRunError};

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Ended,
    Aborted,
}

/// A run as tracked by the registry.
///
/// # Invariants
/// - A run stored in the registry is always `Active`
/// - `Ended`/`Aborted` are only ever seen on the value returned by removal
#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub session_id: String,
    pub participants: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    cancel: CancellationToken,
}

impl Run {
    pub(crate) fn new(
        session_id: &str,
        participants: BTreeSet<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: RunId::new(),
            session_id: session_id.to_string(),
            participants,
            started_at: Utc::now(),
            status: RunStatus::Active,
            cancel,
        }
    }

    /// Whether cancellation was signalled, directly or through a parent.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn signal(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn handle(&self) -> RunHandle {
        RunHandle {
            id: self.id,
            session_id: self.session_id.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Compact info about a run (for API responses).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: RunId,
    pub session_id: String,
    pub participants: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub seconds_active: i64,
    pub cancel_requested: bool,
}

impl From<&Run> for RunInfo {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id,
            session_id: run.session_id.clone(),
            participants: run.participants.iter().cloned().collect(),
            started_at: run.started_at,
            status: run.status,
            seconds_active: (Utc::now() - run.started_at).num_seconds(),
            cancel_requested: run.is_cancel_requested(),
        }
    }
}

/// Returned from [`RunHandle::checkpoint`] once the run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run {0} was cancelled")]
pub struct RunCancelled(pub RunId);

/// What a unit of work holds while it executes.
///
/// Cancellation does not interrupt work in flight; the holder checks it
/// before starting each metered call and then ends the run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    id: RunId,
    session_id: String,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Suspension point: `Err` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), RunCancelled> {
        if self.cancel.is_cancelled() {
            Err(RunCancelled(self.id))
        } else {
            Ok(())
        }
    }

    /// Resolves when the run is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token for handing to nested work. Child tokens of it are cancelled with the run.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_follows_token() {
        let run = Run::new("s1", BTreeSet::new(), CancellationToken::new());
        let handle = run.handle();
        assert!(handle.checkpoint().is_ok());

        run.signal();
        assert!(handle.is_cancelled());
        assert_eq!(handle.checkpoint(), Err(RunCancelled(run.id)));

        // Signalling twice is harmless
        run.signal();
        assert!(run.is_cancel_requested());
    }

    #[test]
    fn test_parent_cancellation_reaches_run() {
        let session = CancellationToken::new();
        let run = Run::new("s1", BTreeSet::new(), session.child_token());
        let nested = run.handle().token().child_token();

        session.cancel();
        assert!(run.is_cancel_requested());
        assert!(nested.is_cancelled());
    }

    #[test]
    fn test_run_info_lists_participants_sorted() {
        let participants: BTreeSet<String> =
            ["writer", "critic"].iter().map(|s| s.to_string()).collect();
        let run = Run::new("s1", participants, CancellationToken::new());
        let info = RunInfo::from(&run);
        assert_eq!(info.participants, vec!["critic".to_string(), "writer".to_string()]);
        assert_eq!(info.status, RunStatus::Active);
        assert!(!info.cancel_requested);
    }
}
