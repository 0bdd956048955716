use super::{BudgetScope, BudgetState, BudgetStatus, Reservation, ReservationState};
use crate::config::BudgetConfig;
use crate::error::{Result, SignalError};
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

type DayClock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Atomic token-budget accounting for daily and lifetime scopes.
pub struct BudgetLedger {
    config: BudgetConfig,
    today: DayClock,
    inner: Mutex<LedgerInner>,
}

struct LedgerInner {
    daily_used: u64,
    lifetime_used: u64,
    lifetime_overage: u64,
    day: NaiveDate,
    held: HashMap<Uuid, Reservation>,
}

impl BudgetLedger {
    /// Create a ledger with zero usage.
    pub fn new(config: BudgetConfig) -> Self {
        Self::with_totals(config, 0, 0)
    }

    /// Create a ledger seeded with persisted totals.
    pub fn with_totals(config: BudgetConfig, daily_used: u64, lifetime_used: u64) -> Self {
        Self::with_clock(config, daily_used, lifetime_used, Arc::new(|| Utc::now().date_naive()))
    }

    /// Create a ledger whose accounting day comes from `today`.
    pub fn with_clock(
        config: BudgetConfig,
        daily_used: u64,
        lifetime_used: u64,
        today: Arc<dyn Fn() -> NaiveDate + Send + Sync>,
    ) -> Self {
        let day = today();
        Self {
            config,
            today,
            inner: Mutex::new(LedgerInner {
                daily_used,
                lifetime_used,
                lifetime_overage: 0,
                day,
                held: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Hold `estimated_tokens` against both scopes, or fail leaving state untouched.
    pub fn reserve(&self, task_id: Uuid, estimated_tokens: u64) -> Result<Reservation> {
        let mut inner = self.inner.lock();
        self.roll_day(&mut inner);

        check_scope(
            BudgetScope::Daily,
            inner.daily_used,
            self.config.daily_limit,
            estimated_tokens,
        )?;
        check_scope(
            BudgetScope::Lifetime,
            inner.lifetime_used,
            self.config.lifetime_limit,
            estimated_tokens,
        )?;

        inner.daily_used = inner.daily_used.saturating_add(estimated_tokens);
        inner.lifetime_used = inner.lifetime_used.saturating_add(estimated_tokens);

        let reservation = Reservation {
            id: Uuid::new_v4(),
            task_id,
            amount: estimated_tokens,
            state: ReservationState::Held,
        };
        inner.held.insert(reservation.id, reservation.clone());

        debug!(
            task_id = %task_id,
            reservation_id = %reservation.id,
            amount = estimated_tokens,
            daily_used = inner.daily_used,
            "Budget reserved"
        );
        Ok(reservation)
    }

    /// Replace the held estimate with the actual usage.
    ///
    /// The daily scope always records the full actual. The lifetime scope is
    /// capped at its limit and anything beyond is kept in `lifetime_overage`.
    pub fn commit(&self, reservation: &Reservation, actual_tokens: u64) -> Result<Reservation> {
        let mut inner = self.inner.lock();
        self.roll_day(&mut inner);
        let held = take_held(&mut inner, reservation, "commit")?;
        let was_warning = self.daily_warning(&inner);

        inner.daily_used = inner
            .daily_used
            .saturating_sub(held.amount)
            .saturating_add(actual_tokens);

        let base = inner.lifetime_used.saturating_sub(held.amount);
        let lifetime = base.saturating_add(actual_tokens);
        let limit = self.config.lifetime_limit;
        if limit > 0 && lifetime > limit {
            let cap = limit.max(base);
            let overage = lifetime - cap;
            inner.lifetime_overage = inner.lifetime_overage.saturating_add(overage);
            inner.lifetime_used = cap;
            warn!(
                task_id = %held.task_id,
                overage,
                lifetime_limit = limit,
                "Actual usage exceeded lifetime budget, capping"
            );
        } else {
            inner.lifetime_used = lifetime;
        }

        if !was_warning && self.daily_warning(&inner) {
            warn!(
                daily_used = inner.daily_used,
                daily_limit = self.config.daily_limit,
                threshold = self.config.warning_threshold,
                "Daily budget warning threshold crossed"
            );
        }

        debug!(
            task_id = %held.task_id,
            reservation_id = %held.id,
            estimated = held.amount,
            actual = actual_tokens,
            "Budget committed"
        );
        Ok(Reservation {
            state: ReservationState::Committed,
            ..held
        })
    }

    /// Undo a held reservation exactly.
    pub fn rollback(&self, reservation: &Reservation) -> Result<Reservation> {
        let mut inner = self.inner.lock();
        self.roll_day(&mut inner);
        let held = take_held(&mut inner, reservation, "rollback")?;

        inner.daily_used = inner.daily_used.saturating_sub(held.amount);
        inner.lifetime_used = inner.lifetime_used.saturating_sub(held.amount);

        debug!(
            task_id = %held.task_id,
            reservation_id = %held.id,
            amount = held.amount,
            "Budget reservation rolled back"
        );
        Ok(Reservation {
            state: ReservationState::RolledBack,
            ..held
        })
    }

    /// Daily scope usage.
    pub fn status(&self) -> BudgetStatus {
        let mut inner = self.inner.lock();
        self.roll_day(&mut inner);
        BudgetStatus::compute(
            inner.daily_used,
            self.config.daily_limit,
            self.config.warning_threshold,
        )
    }

    /// Lifetime scope usage.
    pub fn lifetime_status(&self) -> BudgetStatus {
        let inner = self.inner.lock();
        BudgetStatus::compute(
            inner.lifetime_used,
            self.config.lifetime_limit,
            self.config.warning_threshold,
        )
    }

    pub fn snapshot(&self) -> BudgetState {
        let mut inner = self.inner.lock();
        self.roll_day(&mut inner);
        BudgetState {
            daily_used: inner.daily_used,
            daily_limit: self.config.daily_limit,
            lifetime_used: inner.lifetime_used,
            lifetime_limit: self.config.lifetime_limit,
            warning_threshold: self.config.warning_threshold,
            lifetime_overage: inner.lifetime_overage,
            held_reservations: inner.held.len(),
        }
    }

    /// Start a new accounting day. Held reservations carry over.
    pub fn reset_daily(&self) {
        let mut inner = self.inner.lock();
        let today = (self.today)();
        reset_day(&mut inner, today);
    }

    fn roll_day(&self, inner: &mut LedgerInner) {
        let today = (self.today)();
        if today != inner.day {
            reset_day(inner, today);
        }
    }

    fn daily_warning(&self, inner: &LedgerInner) -> bool {
        BudgetStatus::compute(
            inner.daily_used,
            self.config.daily_limit,
            self.config.warning_threshold,
        )
        .warning
    }
}

fn reset_day(inner: &mut LedgerInner, today: NaiveDate) {
    let carried = inner
        .held
        .values()
        .fold(0u64, |sum, r| sum.saturating_add(r.amount));
    info!(
        previous_day = %inner.day,
        day = %today,
        previous_daily_used = inner.daily_used,
        carried,
        "Daily budget reset"
    );
    inner.daily_used = carried;
    inner.day = today;
}

fn check_scope(scope: BudgetScope, used: u64, limit: u64, requested: u64) -> Result<()> {
    if limit == 0 {
        return Ok(());
    }
    match used.checked_add(requested) {
        Some(total) if total <= limit => Ok(()),
        _ => {
            let remaining = limit.saturating_sub(used);
            warn!(
                scope = %scope,
                used,
                limit,
                requested,
                "Budget reservation refused"
            );
            Err(SignalError::BudgetExceeded {
                scope,
                requested,
                remaining,
            })
        }
    }
}

fn take_held(inner: &mut LedgerInner, reservation: &Reservation, op: &str) -> Result<Reservation> {
    inner.held.remove(&reservation.id).ok_or_else(|| {
        SignalError::InternalFault(format!(
            "{} on reservation {} for task {} which is not held",
            op, reservation.id, reservation.task_id
        ))
    })
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("config", &self.config)
            .field("state", &self.snapshot())
            .finish()
    }
}
