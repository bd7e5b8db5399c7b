//! Budget policy - caps, thresholds, admission decisions and status tiers.
//!
//! # Invariants
//! - Admission denies iff `current + projected > cap` for the first scope that
//!   would overflow (session, provider, model, agent, round in that order)
//! - The stored tier only moves upward until the session is reset
//! - Each tier is reported at most once per crossing (issued flags)

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use super::ledger::{BudgetState, SpendTotals, UsageScope};
use crate::config::ConfigError;

/// Tolerance for comparing accumulated USD amounts.
pub const COST_EPSILON: f64 = 1e-9;

/// Budget status derived from `total / session_cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusTier {
    Healthy,
    Warning,
    Critical,
    Exceeded,
}

impl std::fmt::Display for StatusTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Exceeded => write!(f, "exceeded"),
        }
    }
}

/// Why a usage report or a run was refused.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    #[error("session cap ${cap:.4} would be exceeded (spent ${spent:.4})")]
    ExceedsSessionCap { spent: f64, cap: f64 },

    #[error("provider '{provider}' cap ${cap:.4} would be exceeded (spent ${spent:.4})")]
    ExceedsProviderCap {
        provider: String,
        spent: f64,
        cap: f64,
    },

    #[error("model '{model}' cap ${cap:.4} would be exceeded (spent ${spent:.4})")]
    ExceedsModelCap { model: String, spent: f64, cap: f64 },

    #[error("agent '{agent}' cap ${cap:.4} would be exceeded (spent ${spent:.4})")]
    ExceedsAgentCap { agent: String, spent: f64, cap: f64 },

    #[error("round {round} cap ${cap:.4} would be exceeded (spent ${spent:.4})")]
    ExceedsRoundCap { round: u32, spent: f64, cap: f64 },

    #[error("session budget already exceeded")]
    BudgetExceeded,

    #[error("cost for {provider}/{model} is not a valid amount ({cost})")]
    InvalidCost {
        provider: String,
        model: String,
        cost: f64,
    },
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allow,
    Deny(DenyReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Tier bookkeeping stored with each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierProgress {
    pub tier: StatusTier,
    pub warning_issued: bool,
    pub critical_issued: bool,
    pub exceeded_issued: bool,
}

impl Default for TierProgress {
    fn default() -> Self {
        Self {
            tier: StatusTier::Healthy,
            warning_issued: false,
            critical_issued: false,
            exceeded_issued: false,
        }
    }
}

impl TierProgress {
    fn issued(&mut self, tier: StatusTier) -> Option<&mut bool> {
        match tier {
            StatusTier::Healthy => None,
            StatusTier::Warning => Some(&mut self.warning_issued),
            StatusTier::Critical => Some(&mut self.critical_issued),
            StatusTier::Exceeded => Some(&mut self.exceeded_issued),
        }
    }
}

/// Advisory projection of where spend is heading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrunProjection {
    /// Number of recent entries the average was taken over.
    pub sample_size: usize,
    pub average_cost: f64,
    pub projected_total: f64,
    /// Calls left at the average cost before the cap is reached.
    pub calls_remaining: Option<u64>,
    pub will_exceed: bool,
}

/// Caps and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetLimits {
    pub session_cap: f64,
    pub provider_caps: HashMap<String, f64>,
    /// Per-session caps keyed by model name.
    pub model_caps: HashMap<String, f64>,
    /// Per-session cap applied to each agent separately.
    pub agent_cap: Option<f64>,
    /// Per-session cap applied to each round separately.
    pub round_cap: Option<f64>,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            session_cap: 10.0,
            provider_caps: HashMap::new(),
            model_caps: HashMap::new(),
            agent_cap: None,
            round_cap: None,
            warning_threshold: 0.7,
            critical_threshold: 0.9,
        }
    }
}

fn over(spent: f64, projected: f64, cap: f64) -> bool {
    spent + projected > cap + COST_EPSILON
}

impl BudgetLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.session_cap > 0.0) {
            return Err(ConfigError::InvalidCap {
                scope: "session".to_string(),
                value: self.session_cap,
            });
        }
        let named = self
            .provider_caps
            .iter()
            .map(|(k, v)| (format!("provider '{}'", k), *v))
            .chain(self.model_caps.iter().map(|(k, v)| (format!("model '{}'", k), *v)))
            .chain(self.agent_cap.map(|v| ("agent".to_string(), v)))
            .chain(self.round_cap.map(|v| ("round".to_string(), v)));
        for (scope, value) in named {
            if !(value > 0.0) {
                return Err(ConfigError::InvalidCap { scope, value });
            }
        }
        if !(self.warning_threshold > 0.0 && self.warning_threshold < 1.0) {
            return Err(ConfigError::InvalidThresholds {
                warning: self.warning_threshold,
                critical: self.critical_threshold,
            });
        }
        if !(self.critical_threshold > self.warning_threshold && self.critical_threshold <= 1.0) {
            return Err(ConfigError::InvalidThresholds {
                warning: self.warning_threshold,
                critical: self.critical_threshold,
            });
        }
        Ok(())
    }

    /// Check a projected cost against current totals.
    ///
    /// Optimistic: in-flight work that has not reported yet is invisible here.
    pub fn evaluate_admission(
        &self,
        totals: &SpendTotals,
        scope: &UsageScope,
        projected_cost: f64,
    ) -> Admission {
        if over(totals.total, projected_cost, self.session_cap) {
            return Admission::Deny(DenyReason::ExceedsSessionCap {
                spent: totals.total,
                cap: self.session_cap,
            });
        }

        if let Some(cap) = self.provider_caps.get(&scope.provider) {
            let spent = totals.provider(&scope.provider);
            if over(spent, projected_cost, *cap) {
                return Admission::Deny(DenyReason::ExceedsProviderCap {
                    provider: scope.provider.clone(),
                    spent,
                    cap: *cap,
                });
            }
        }

        if let Some(cap) = self.model_caps.get(&scope.model) {
            let spent = totals.model(&scope.model);
            if over(spent, projected_cost, *cap) {
                return Admission::Deny(DenyReason::ExceedsModelCap {
                    model: scope.model.clone(),
                    spent,
                    cap: *cap,
                });
            }
        }

        if let (Some(cap), Some(agent)) = (self.agent_cap, scope.agent.as_deref()) {
            let spent = totals.agent(agent);
            if over(spent, projected_cost, cap) {
                return Admission::Deny(DenyReason::ExceedsAgentCap {
                    agent: agent.to_string(),
                    spent,
                    cap,
                });
            }
        }

        if let (Some(cap), Some(round)) = (self.round_cap, scope.round) {
            let spent = totals.round(round);
            if over(spent, projected_cost, cap) {
                return Admission::Deny(DenyReason::ExceedsRoundCap { round, spent, cap });
            }
        }

        Admission::Allow
    }

    /// Highest tier whose threshold `total / session_cap` has reached.
    pub fn compute_tier(&self, total: f64) -> StatusTier {
        let ratio = total / self.session_cap;
        if ratio + COST_EPSILON >= 1.0 {
            StatusTier::Exceeded
        } else if ratio + COST_EPSILON >= self.critical_threshold {
            StatusTier::Critical
        } else if ratio + COST_EPSILON >= self.warning_threshold {
            StatusTier::Warning
        } else {
            StatusTier::Healthy
        }
    }

    /// Raise the stored tier and return every tier crossed for the first time.
    ///
    /// A jump straight from healthy to exceeded reports warning, critical and
    /// exceeded, in that order.
    pub fn advance(&self, total: f64, progress: &mut TierProgress) -> Vec<StatusTier> {
        let computed = self.compute_tier(total);
        if computed > progress.tier {
            progress.tier = computed;
        }

        let mut crossed = Vec::new();
        for tier in [StatusTier::Warning, StatusTier::Critical, StatusTier::Exceeded] {
            if tier > progress.tier {
                break;
            }
            if let Some(flag) = progress.issued(tier) {
                if !*flag {
                    *flag = true;
                    crossed.push(tier);
                }
            }
        }
        crossed
    }

    /// Average the last `window` costs and project `lookahead` more calls.
    pub fn project_overrun(
        &self,
        total: f64,
        recent_costs: &[f64],
        window: usize,
        lookahead: u32,
    ) -> OverrunProjection {
        let start = recent_costs.len().saturating_sub(window);
        let sample = &recent_costs[start..];
        if sample.is_empty() {
            return OverrunProjection {
                sample_size: 0,
                average_cost: 0.0,
                projected_total: total,
                calls_remaining: None,
                will_exceed: false,
            };
        }

        let average_cost = sample.iter().sum::<f64>() / sample.len() as f64;
        let projected_total = total + average_cost * lookahead as f64;
        let remaining = (self.session_cap - total).max(0.0);
        let calls_remaining = if average_cost > 0.0 {
            Some((remaining / average_cost).floor() as u64)
        } else {
            None
        };

        OverrunProjection {
            sample_size: sample.len(),
            average_cost,
            projected_total,
            calls_remaining,
            will_exceed: projected_total > self.session_cap + COST_EPSILON,
        }
    }
}

/// Shared, runtime-adjustable budget policy.
///
/// Readers take a cheap `Arc` snapshot of the limits; `update_limits` swaps
/// the whole set so a check never sees half-applied caps.
pub struct BudgetPolicy {
    limits: RwLock<Arc<BudgetLimits>>,
    overrun_window: usize,
    overrun_lookahead: u32,
}

impl BudgetPolicy {
    pub fn new(limits: BudgetLimits, overrun_window: usize, overrun_lookahead: u32) -> Self {
        Self {
            limits: RwLock::new(Arc::new(limits)),
            overrun_window,
            overrun_lookahead,
        }
    }

    /// Current limits snapshot.
    pub async fn limits(&self) -> Arc<BudgetLimits> {
        Arc::clone(&*self.limits.read().await)
    }

    /// Replace the caps. Tier effects are picked up by the next re-check.
    pub async fn update_limits(&self, limits: BudgetLimits) -> Result<(), ConfigError> {
        limits.validate()?;
        tracing::info!(
            session_cap = limits.session_cap,
            warning = limits.warning_threshold,
            critical = limits.critical_threshold,
            "Budget limits updated"
        );
        *self.limits.write().await = Arc::new(limits);
        Ok(())
    }

    pub async fn evaluate_admission(
        &self,
        state: &BudgetState,
        scope: &UsageScope,
        projected_cost: f64,
    ) -> Admission {
        self.limits()
            .await
            .evaluate_admission(&state.totals, scope, projected_cost)
    }

    /// Tier for a snapshot, without touching issued flags.
    pub async fn compute_tier(&self, state: &BudgetState) -> StatusTier {
        self.limits().await.compute_tier(state.totals.total)
    }

    pub async fn project_overrun(&self, state: &BudgetState) -> OverrunProjection {
        let costs: Vec<f64> = state.entries.iter().map(|e| e.cost).collect();
        self.limits().await.project_overrun(
            state.totals.total,
            &costs,
            self.overrun_window,
            self.overrun_lookahead,
        )
    }
}
