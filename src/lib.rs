//! Spend governor - budget-bounded concurrency for metered, cancellable runs.
//!
//! # Architecture
//! - `budget`: pricing, the cost ledger and the budget policy
//! - `runs`: run identity, cancellation handles and the run registry
//! - `governor`: composes the above, with a periodic re-check and kill switch
//! - `events`: typed broadcast of tier, run and kill events
//! - `config`: configuration from files, environment or code

pub mod budget;
pub mod config;
pub mod events;
pub mod governor;
pub mod runs;

pub use budget::{
    Admission, BudgetLimits, BudgetState, DenyReason, StatusTier, UsageOutcome, UsageScope,
};
pub use config::{ConfigError, GovernorConfig};
pub use events::{EventKind, EventListener, EventPayload, GovernorEvent, Subscription};
pub use governor::{Governor, KillReport};
pub use runs::{RunCancelled, RunHandle, RunId, RunInfo, StartRunError};
