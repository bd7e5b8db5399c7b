//! Cost ledger - prices usage reports and keeps per-session totals.
//!
//! Each session owns one [`SessionBook`] behind its own mutex, so reporters on
//! different sessions never contend, while admission check, append and tier
//! advance for a single session happen in one critical section.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::policy::{Admission, BudgetLimits, DenyReason, StatusTier, TierProgress};
use super::pricing::PricingTable;

/// Coordinates of a usage report along the capped dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageScope {
    pub provider: String,
    pub model: String,
    pub agent: Option<String>,
    pub round: Option<u32>,
}

impl UsageScope {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            agent: None,
            round: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }
}

/// One accepted, priced usage report. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub agent: Option<String>,
    pub round: Option<u32>,
    pub input_units: u64,
    pub output_units: u64,
    pub cost: f64,
}

/// Cumulative spend along every scope dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendTotals {
    pub total: f64,
    pub by_provider: HashMap<String, f64>,
    pub by_model: HashMap<String, f64>,
    pub by_agent: HashMap<String, f64>,
    pub by_round: HashMap<u32, f64>,
}

impl SpendTotals {
    pub fn provider(&self, provider: &str) -> f64 {
        self.by_provider.get(provider).copied().unwrap_or(0.0)
    }

    pub fn model(&self, model: &str) -> f64 {
        self.by_model.get(model).copied().unwrap_or(0.0)
    }

    pub fn agent(&self, agent: &str) -> f64 {
        self.by_agent.get(agent).copied().unwrap_or(0.0)
    }

    pub fn round(&self, round: u32) -> f64 {
        self.by_round.get(&round).copied().unwrap_or(0.0)
    }

    fn add(&mut self, scope: &UsageScope, cost: f64) {
        self.total += cost;
        *self.by_provider.entry(scope.provider.clone()).or_insert(0.0) += cost;
        *self.by_model.entry(scope.model.clone()).or_insert(0.0) += cost;
        if let Some(agent) = &scope.agent {
            *self.by_agent.entry(agent.clone()).or_insert(0.0) += cost;
        }
        if let Some(round) = scope.round {
            *self.by_round.entry(round).or_insert(0.0) += cost;
        }
    }
}

/// Value snapshot of one session's budget. Mutating it changes nothing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetState {
    pub session_id: String,
    pub totals: SpendTotals,
    /// Most recent entries, oldest first.
    pub entries: Vec<UsageEntry>,
    /// Accepted entries since the last reset, including ones rotated out of `entries`.
    pub entry_count: u64,
    #[serde(flatten)]
    pub progress: TierProgress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetState {
    pub fn tier(&self) -> StatusTier {
        self.progress.tier
    }

    pub fn total_spent(&self) -> f64 {
        self.totals.total
    }
}

/// Result of [`CostLedger::record_usage`].
#[derive(Debug, Clone)]
pub enum UsageOutcome {
    Accepted {
        entry: UsageEntry,
        totals: SpendTotals,
        /// Tiers crossed for the first time by this entry.
        crossed: Vec<StatusTier>,
    },
    Denied {
        reason: DenyReason,
        cost: f64,
    },
}

impl UsageOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn cost(&self) -> f64 {
        match self {
            Self::Accepted { entry, .. } => entry.cost,
            Self::Denied { cost, .. } => *cost,
        }
    }

    pub fn totals(&self) -> Option<&SpendTotals> {
        match self {
            Self::Accepted { totals, .. } => Some(totals),
            Self::Denied { .. } => None,
        }
    }
}

/// Mutable per-session bookkeeping. Only reachable through [`CostLedger`].
#[derive(Debug)]
struct SessionBook {
    session_id: String,
    totals: SpendTotals,
    entries: VecDeque<UsageEntry>,
    entry_count: u64,
    progress: TierProgress,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionBook {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            totals: SpendTotals::default(),
            entries: VecDeque::new(),
            entry_count: 0,
            progress: TierProgress::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn push(&mut self, entry: UsageEntry, capacity: usize) {
        if self.entries.len() == capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.entry_count += 1;
    }

    fn snapshot(&self) -> BudgetState {
        BudgetState {
            session_id: self.session_id.clone(),
            totals: self.totals.clone(),
            entries: self.entries.iter().cloned().collect(),
            entry_count: self.entry_count,
            progress: self.progress,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn clear(&mut self) {
        self.totals = SpendTotals::default();
        self.entries.clear();
        self.entry_count = 0;
        self.progress = TierProgress::default();
        self.updated_at = Utc::now();
    }
}

/// Tier changes found by a re-check of one session.
#[derive(Debug, Clone)]
pub struct Reevaluation {
    pub session_id: String,
    pub total: f64,
    pub crossed: Vec<StatusTier>,
}

/// Records metered usage and maintains per-session totals.
pub struct CostLedger {
    pricing: PricingTable,
    history_capacity: usize,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionBook>>>>,
}

impl CostLedger {
    pub fn new(pricing: PricingTable, history_capacity: usize) -> Self {
        Self {
            pricing,
            history_capacity: history_capacity.max(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    async fn book(&self, session_id: &str) -> Option<Arc<Mutex<SessionBook>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn book_or_create(&self, session_id: &str) -> Arc<Mutex<SessionBook>> {
        if let Some(book) = self.book(session_id).await {
            return book;
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SessionBook::new(session_id)))),
        )
    }

    /// Create the session's state ahead of its first report.
    ///
    /// Returns `false` if the session already existed.
    pub async fn open_session(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(SessionBook::new(session_id))),
        );
        true
    }

    /// Price a report, check it against `limits` and append it if admitted.
    ///
    /// Admission, append and tier advance share one critical section, so
    /// concurrent reports on the same session serialize here.
    pub async fn record_usage(
        &self,
        session_id: &str,
        scope: &UsageScope,
        input_units: u64,
        output_units: u64,
        limits: &BudgetLimits,
    ) -> UsageOutcome {
        let quote = self.pricing.quote(&scope.provider, &scope.model);
        if quote.is_fallback() {
            tracing::warn!(
                provider = %scope.provider,
                model = %scope.model,
                input_per_1k = quote.rate.input_per_1k,
                output_per_1k = quote.rate.output_per_1k,
                "No pricing for model, using fallback rate"
            );
        }
        let cost = quote.rate.cost(input_units, output_units);
        if !(cost.is_finite() && cost >= 0.0) {
            return UsageOutcome::Denied {
                reason: DenyReason::InvalidCost {
                    provider: scope.provider.clone(),
                    model: scope.model.clone(),
                    cost,
                },
                cost,
            };
        }

        let book = self.book_or_create(session_id).await;
        let mut book = book.lock().await;

        if let Admission::Deny(reason) = limits.evaluate_admission(&book.totals, scope, cost) {
            return UsageOutcome::Denied { reason, cost };
        }

        let entry = UsageEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            provider: scope.provider.clone(),
            model: scope.model.clone(),
            agent: scope.agent.clone(),
            round: scope.round,
            input_units,
            output_units,
            cost,
        };

        book.totals.add(scope, cost);
        book.push(entry.clone(), self.history_capacity);
        book.updated_at = entry.timestamp;
        let total = book.totals.total;
        let crossed = limits.advance(total, &mut book.progress);

        UsageOutcome::Accepted {
            entry,
            totals: book.totals.clone(),
            crossed,
        }
    }

    /// Re-run tier evaluation for one session without new usage.
    pub async fn reevaluate(
        &self,
        session_id: &str,
        limits: &BudgetLimits,
    ) -> Option<Reevaluation> {
        let book = self.book(session_id).await?;
        let mut book = book.lock().await;
        let total = book.totals.total;
        let crossed = limits.advance(total, &mut book.progress);
        Some(Reevaluation {
            session_id: session_id.to_string(),
            total,
            crossed,
        })
    }

    /// Re-run tier evaluation for every known session.
    pub async fn reevaluate_all(&self, limits: &BudgetLimits) -> Vec<Reevaluation> {
        let mut results = Vec::new();
        for session_id in self.sessions().await {
            if let Some(result) = self.reevaluate(&session_id, limits).await {
                results.push(result);
            }
        }
        results
    }

    pub async fn query_state(&self, session_id: &str) -> Option<BudgetState> {
        let book = self.book(session_id).await?;
        let book = book.lock().await;
        Some(book.snapshot())
    }

    /// Stored tier of a session; unknown sessions are healthy.
    pub async fn tier(&self, session_id: &str) -> StatusTier {
        match self.book(session_id).await {
            Some(book) => book.lock().await.progress.tier,
            None => StatusTier::Healthy,
        }
    }

    /// Last `n` entries in insertion order.
    pub async fn recent_entries(&self, session_id: &str, n: usize) -> Vec<UsageEntry> {
        let Some(book) = self.book(session_id).await else {
            return Vec::new();
        };
        let book = book.lock().await;
        let skip = book.entries.len().saturating_sub(n);
        book.entries.iter().skip(skip).cloned().collect()
    }

    /// Zero a session's totals and issued flags. Returns the previous total.
    pub async fn reset(&self, session_id: &str) -> Option<f64> {
        let book = self.book(session_id).await?;
        let mut book = book.lock().await;
        let previous = book.totals.total;
        book.clear();
        Some(previous)
    }

    pub async fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
