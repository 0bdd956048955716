//! Token budget accounting
//!
//! [`BudgetLedger`] owns the daily and lifetime counters and every
//! outstanding [`Reservation`]. All mutation happens through
//! reserve/commit/rollback under one lock, never across an await point.

mod ledger;

pub use ledger::BudgetLedger;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Budget scope a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetScope {
    Daily,
    Lifetime,
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetScope::Daily => f.write_str("daily"),
            BudgetScope::Lifetime => f.write_str("lifetime"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Held,
    Committed,
    RolledBack,
}

/// A provisional hold on budget for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub amount: u64,
    pub state: ReservationState,
}

/// Point-in-time copy of the ledger counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    pub daily_used: u64,
    pub daily_limit: u64,
    pub lifetime_used: u64,
    pub lifetime_limit: u64,
    pub warning_threshold: f64,
    /// Tokens committed past the lifetime cap
    pub lifetime_overage: u64,
    pub held_reservations: usize,
}

/// Usage summary for one scope. A limit of zero means unlimited, in which
/// case `remaining` is `u64::MAX` and `warning` is never set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub warning: bool,
}

impl BudgetStatus {
    pub(crate) fn compute(used: u64, limit: u64, threshold: f64) -> Self {
        if limit == 0 {
            return Self {
                used,
                limit,
                remaining: u64::MAX,
                warning: false,
            };
        }
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            warning: used as f64 >= threshold * limit as f64,
        }
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.used as f64 / self.limit as f64 * 100.0
        }
    }

    /// Get status message
    pub fn message(&self) -> String {
        if self.limit == 0 {
            format!("{} tokens used (unlimited)", self.used)
        } else if self.remaining == 0 {
            "Budget limit exceeded".to_string()
        } else if self.warning {
            format!(
                "Warning: budget usage at {:.1}% - {} tokens remaining",
                self.usage_percentage(),
                self.remaining
            )
        } else {
            format!(
                "Budget usage at {:.1}% - {} tokens remaining",
                self.usage_percentage(),
                self.remaining
            )
        }
    }
}
