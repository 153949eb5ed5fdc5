//! Daily LLM spend ledgers. Counters are atomics behind a read-mostly
//! map: the debit path takes no exclusive lock once a tenant exists, so
//! a burst can overshoot a cap by a few in-flight calls. That slack is
//! budgeted into the daily caps.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::NaiveDate;

use tally_journal::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Debited,
    TenantExhausted,
    GlobalExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalBudget {
    pub daily_call_cap: u64,
    pub daily_cost_cap_microcents: u64,
}

impl Default for GlobalBudget {
    fn default() -> Self {
        Self {
            daily_call_cap: 50_000,
            daily_cost_cap_microcents: 500_000_000,
        }
    }
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    cost_microcents: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> (u64, u64) {
        (
            self.calls.load(Ordering::Relaxed),
            self.cost_microcents.load(Ordering::Relaxed),
        )
    }

    fn debit(&self, cost: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.cost_microcents.fetch_add(cost, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.cost_microcents.store(0, Ordering::Relaxed);
    }
}

pub struct BudgetLedger {
    global_caps: GlobalBudget,
    global: Counters,
    tenants: RwLock<HashMap<TenantId, Arc<Counters>>>,
    /// Day the counters describe; rolling over resets everything.
    day: Mutex<Option<NaiveDate>>,
}

impl BudgetLedger {
    #[must_use]
    pub fn new(global_caps: GlobalBudget) -> Self {
        Self {
            global_caps,
            global: Counters::default(),
            tenants: RwLock::new(HashMap::new()),
            day: Mutex::new(None),
        }
    }

    fn roll_to(&self, today: NaiveDate) {
        let mut day = match self.day.lock() {
            Ok(day) => day,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *day == Some(today) {
            return;
        }
        *day = Some(today);
        self.global.reset();
        if let Ok(tenants) = self.tenants.read() {
            for counters in tenants.values() {
                counters.reset();
            }
        }
    }

    fn tenant_counters(&self, tenant: &TenantId) -> Arc<Counters> {
        if let Ok(tenants) = self.tenants.read()
            && let Some(counters) = tenants.get(tenant)
        {
            return counters.clone();
        }
        let mut tenants = match self.tenants.write() {
            Ok(tenants) => tenants,
            Err(poisoned) => poisoned.into_inner(),
        };
        tenants.entry(tenant.clone()).or_default().clone()
    }

    /// Check-before-debit against both ledgers. The check and the add are
    /// not one atomic step; concurrent callers may overshoot slightly,
    /// never block.
    pub fn debit_if_available(
        &self,
        tenant: &TenantId,
        today: NaiveDate,
        tenant_call_cap: u64,
        tenant_cost_cap_microcents: u64,
        cost_microcents: u64,
    ) -> BudgetDecision {
        self.roll_to(today);

        let (global_calls, global_cost) = self.global.snapshot();
        if global_calls >= self.global_caps.daily_call_cap
            || global_cost >= self.global_caps.daily_cost_cap_microcents
        {
            return BudgetDecision::GlobalExhausted;
        }

        let counters = self.tenant_counters(tenant);
        let (calls, cost) = counters.snapshot();
        if calls >= tenant_call_cap || cost >= tenant_cost_cap_microcents {
            return BudgetDecision::TenantExhausted;
        }

        counters.debit(cost_microcents);
        self.global.debit(cost_microcents);
        BudgetDecision::Debited
    }

    /// Spent calls and cost for one tenant today.
    #[must_use]
    pub fn tenant_spend(&self, tenant: &TenantId) -> (u64, u64) {
        self.tenant_counters(tenant).snapshot()
    }

    #[must_use]
    pub fn global_spend(&self) -> (u64, u64) {
        self.global.snapshot()
    }
}
