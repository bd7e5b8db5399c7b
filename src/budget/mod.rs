//! Budget module - cost accounting, pricing and policy.
//!
//! # Key Concepts
//! - Ledger: prices usage reports and keeps per-session totals
//! - Pricing: per-1000-unit rates with an explicit fallback
//! - Policy: caps, thresholds, admission decisions and status tiers

mod ledger;
mod policy;
mod pricing;

pub use ledger::{
    BudgetState, CostLedger, Reevaluation, SpendTotals, UsageEntry, UsageOutcome, UsageScope,
};
pub use policy::{
    Admission, BudgetLimits, BudgetPolicy, DenyReason, OverrunProjection, StatusTier,
    TierProgress, COST_EPSILON,
};
pub use pricing::{
    ModelRate, PriceQuote, PricingConfig, PricingRow, PricingTable, RateSource,
    DEFAULT_FALLBACK_RATE,
};
