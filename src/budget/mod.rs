pub mod ledger;

pub use ledger::{SqliteLedger, UsageLedger};

use crate::config::{BudgetConfig, BudgetPeriod};
use crate::error::StorageError;
use crate::model::{AIUsageEvent, BudgetState, TenantBudget};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Estimated spend held against a tenant until the real cost is recorded.
#[must_use = "a reservation must be passed to BudgetGovernor::record"]
#[derive(Debug)]
pub struct Reservation {
    tenant_id: String,
    period_start: DateTime<Utc>,
    amount: f64,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }
}

/// Spend reached `near_limit_ratio` of the limit; raised once per tenant and period.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetAlert {
    pub tenant_id: String,
    pub period_start: DateTime<Utc>,
    pub consumed: f64,
    pub limit: f64,
}

const NEAR_LIMIT_ALERT: &str = "near_limit";

#[derive(Debug)]
pub enum Authorization {
    Allowed(Reservation),
    Denied(TenantBudget),
}

#[derive(Debug, Default)]
struct TenantSlot {
    period_start: Option<DateTime<Utc>>,
    reserved: f64,
}

pub struct BudgetGovernor {
    ledger: Arc<dyn UsageLedger>,
    config: BudgetConfig,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<TenantSlot>>>>,
}

impl BudgetGovernor {
    pub fn new(ledger: Arc<dyn UsageLedger>, config: BudgetConfig) -> Self {
        Self {
            ledger,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn authorize(
        &self,
        tenant_id: &str,
        estimated_cost: f64,
    ) -> Result<Authorization, StorageError> {
        self.authorize_at(tenant_id, estimated_cost, Utc::now()).await
    }

    pub async fn authorize_at(
        &self,
        tenant_id: &str,
        estimated_cost: f64,
        now: DateTime<Utc>,
    ) -> Result<Authorization, StorageError> {
        let slot = self.slot(tenant_id);
        let mut slot = slot.lock().await;

        let (start, end) = self.period_at(now);
        if slot.period_start != Some(start) {
            // Rollover: reservations from the previous period no longer count.
            slot.period_start = Some(start);
            slot.reserved = 0.0;
        }

        let budget = self.load_budget(tenant_id, start, end).await?;
        let exhausted = budget.state(self.config.near_limit_ratio) == BudgetState::Exhausted;
        let committed = budget.consumed + slot.reserved + estimated_cost;

        if exhausted || committed > budget.limit {
            log::warn!(
                "Denied inference for tenant {}: consumed {:.4} + reserved {:.4} + estimate {:.4} > limit {:.4}",
                tenant_id,
                budget.consumed,
                slot.reserved,
                estimated_cost,
                budget.limit
            );
            return Ok(Authorization::Denied(budget));
        }

        slot.reserved += estimated_cost;
        log::debug!(
            "Reserved {:.4} for tenant {} ({:.4} outstanding)",
            estimated_cost,
            tenant_id,
            slot.reserved
        );
        Ok(Authorization::Allowed(Reservation {
            tenant_id: tenant_id.to_string(),
            period_start: start,
            amount: estimated_cost,
        }))
    }

    /// Appends the actual usage and releases the reservation. The
    /// reservation is released even when the append fails; callers must
    /// treat that error as fatal for the job.
    ///
    /// Returns the near-limit alert when this event is the first of the
    /// period to push spend past `near_limit_ratio`.
    pub async fn record(
        &self,
        reservation: Reservation,
        event: AIUsageEvent,
    ) -> Result<Option<BudgetAlert>, StorageError> {
        let slot = self.slot(&reservation.tenant_id);
        let mut slot = slot.lock().await;

        let appended = self.ledger.append(&event).await;

        if slot.period_start == Some(reservation.period_start) {
            slot.reserved = (slot.reserved - reservation.amount).max(0.0);
        }

        match &appended {
            Ok(()) => log::debug!(
                "Recorded {:.4} ({:?}) for tenant {}",
                event.cost,
                event.outcome,
                event.tenant_id
            ),
            Err(e) => log::error!(
                "Failed to record usage for tenant {}: {}",
                event.tenant_id,
                e
            ),
        }
        appended?;

        // The spend is already on the ledger; a failed alert check must not undo that.
        match self
            .near_limit_alert(&reservation.tenant_id, reservation.period_start)
            .await
        {
            Ok(alert) => Ok(alert),
            Err(e) => {
                log::warn!(
                    "Could not check budget alert for tenant {}: {}",
                    reservation.tenant_id,
                    e
                );
                Ok(None)
            }
        }
    }

    async fn near_limit_alert(
        &self,
        tenant_id: &str,
        period_start: DateTime<Utc>,
    ) -> Result<Option<BudgetAlert>, StorageError> {
        let (start, end) = self.period_at(period_start);
        let budget = self.load_budget(tenant_id, start, end).await?;
        if budget.limit <= 0.0
            || budget.state(self.config.near_limit_ratio) == BudgetState::UnderBudget
        {
            return Ok(None);
        }
        if !self.ledger.mark_alert(tenant_id, start, NEAR_LIMIT_ALERT).await? {
            return Ok(None);
        }

        log::warn!(
            "Tenant {} has spent {:.4} of {:.4} ({:.0}%) in the period starting {}",
            tenant_id,
            budget.consumed,
            budget.limit,
            budget.consumed / budget.limit * 100.0,
            start.format("%Y-%m-%d")
        );
        Ok(Some(BudgetAlert {
            tenant_id: tenant_id.to_string(),
            period_start: start,
            consumed: budget.consumed,
            limit: budget.limit,
        }))
    }

    pub async fn budget(&self, tenant_id: &str) -> Result<TenantBudget, StorageError> {
        let (start, end) = self.period_at(Utc::now());
        self.load_budget(tenant_id, start, end).await
    }

    pub async fn state(&self, tenant_id: &str) -> Result<BudgetState, StorageError> {
        Ok(self
            .budget(tenant_id)
            .await?
            .state(self.config.near_limit_ratio))
    }

    /// Administrative override: replaces the tenant's limit.
    pub async fn set_limit(&self, tenant_id: &str, limit: f64) -> Result<(), StorageError> {
        let slot = self.slot(tenant_id);
        let _guard = slot.lock().await;
        self.ledger.set_limit(tenant_id, limit).await?;
        log::info!("Set budget limit for tenant {} to {:.4}", tenant_id, limit);
        Ok(())
    }

    async fn load_budget(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TenantBudget, StorageError> {
        let limit = self
            .ledger
            .limit_for(tenant_id)
            .await?
            .unwrap_or(self.config.default_limit);
        let consumed = self.ledger.consumed(tenant_id, start, end).await?;
        Ok(TenantBudget {
            tenant_id: tenant_id.to_string(),
            period_start: start,
            period_end: end,
            limit,
            consumed,
        })
    }

    fn period_at(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        period_bounds(self.config.period, self.config.billing_day, now)
    }

    fn slot(&self, tenant_id: &str) -> Arc<AsyncMutex<TenantSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(tenant_id.to_string()).or_default().clone()
    }
}

/// `[start, end)` of the budget period containing `now`, in UTC. Monthly
/// periods start on `billing_day`, or the month's last day when it is shorter.
pub fn period_bounds(
    period: BudgetPeriod,
    billing_day: u32,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let (start, end) = match period {
        BudgetPeriod::Daily => (today, today + Duration::days(1)),
        BudgetPeriod::Weekly => {
            let start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
            (start, start + Duration::days(7))
        }
        BudgetPeriod::Monthly => {
            let this_month = billing_date(today.year(), today.month(), billing_day).unwrap_or(today);
            let start = if today >= this_month {
                this_month
            } else {
                let (year, month) = shift_month(today, -1);
                billing_date(year, month, billing_day).unwrap_or(today)
            };
            let (year, month) = shift_month(start, 1);
            let end = billing_date(year, month, billing_day).unwrap_or(start + Duration::days(31));
            (start, end)
        }
    };
    (midnight(start), midnight(end))
}

fn billing_date(year: i32, month: u32, billing_day: u32) -> Option<NaiveDate> {
    (1..=billing_day.clamp(1, 31))
        .rev()
        .find_map(|day| NaiveDate::from_ymd_opt(year, month, day))
}

fn shift_month(date: NaiveDate, months: i32) -> (i32, u32) {
    let index = date.year() * 12 + date.month0() as i32 + months;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::UsageOutcome;
    use chrono::TimeZone;

    async fn governor(limit: f64) -> (tempfile::TempDir, BudgetGovernor) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(dir.path().join("budget.db").to_str().unwrap())
            .await
            .unwrap();
        let ledger = Arc::new(SqliteLedger::new(pool).await.unwrap());
        let config = BudgetConfig {
            default_limit: limit,
            near_limit_ratio: 0.8,
            period: BudgetPeriod::Monthly,
            billing_day: 1,
        };
        (dir, BudgetGovernor::new(ledger, config))
    }

    fn spend(tenant: &str, cost: f64, at: DateTime<Utc>) -> AIUsageEvent {
        AIUsageEvent {
            tenant_id: tenant.to_string(),
            user_id: None,
            feature: "selector_inference".to_string(),
            model: "gpt-4o".to_string(),
            tokens_in: 1000,
            tokens_out: 100,
            cost,
            timestamp: at,
            outcome: UsageOutcome::Success,
        }
    }

    #[tokio::test]
    async fn denies_when_estimate_would_cross_limit() {
        let (_dir, gov) = governor(100.0).await;
        let now = Utc::now();

        let Authorization::Allowed(r) = gov.authorize_at("acme", 95.0, now).await.unwrap() else {
            panic!("first call should be allowed");
        };
        gov.record(r, spend("acme", 95.0, now)).await.unwrap();

        let denied = gov.authorize_at("acme", 10.0, now).await.unwrap();
        match denied {
            Authorization::Denied(budget) => {
                assert_eq!(budget.consumed, 95.0);
                assert_eq!(budget.state(0.8), BudgetState::NearLimit);
            }
            other => panic!("expected denial, got {other:?}"),
        }

        let (start, end) = period_bounds(BudgetPeriod::Monthly, 1, now);
        let events = gov.ledger.events("acme", start, end).await.unwrap();
        assert_eq!(events.len(), 1, "denied attempts write no usage event");
    }

    #[tokio::test]
    async fn outstanding_reservations_count_against_the_limit() {
        let (_dir, gov) = governor(10.0).await;
        let now = Utc::now();

        let first = gov.authorize_at("acme", 6.0, now).await.unwrap();
        assert!(matches!(first, Authorization::Allowed(_)));
        // A concurrent worker cannot also reserve before the first records.
        assert!(matches!(
            gov.authorize_at("acme", 6.0, now).await.unwrap(),
            Authorization::Denied(_)
        ));

        let Authorization::Allowed(r) = first else { unreachable!() };
        gov.record(r, spend("acme", 2.0, now)).await.unwrap();
        assert!(matches!(
            gov.authorize_at("acme", 6.0, now).await.unwrap(),
            Authorization::Allowed(_)
        ));
    }

    #[tokio::test]
    async fn exhausted_tenants_wait_for_rollover_or_override() {
        let (_dir, gov) = governor(5.0).await;
        let may = Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).unwrap();
        let june = Utc.with_ymd_and_hms(2026, 6, 2, 9, 0, 0).unwrap();

        let Authorization::Allowed(r) = gov.authorize_at("acme", 1.0, may).await.unwrap() else {
            panic!("should be allowed");
        };
        // Actual cost overshoots the estimate.
        gov.record(r, spend("acme", 5.0, may)).await.unwrap();

        assert!(matches!(
            gov.authorize_at("acme", 0.0, may).await.unwrap(),
            Authorization::Denied(_)
        ));
        assert!(matches!(
            gov.authorize_at("acme", 1.0, june).await.unwrap(),
            Authorization::Allowed(_)
        ));

        gov.set_limit("acme", 20.0).await.unwrap();
        assert!(matches!(
            gov.authorize_at("acme", 1.0, may).await.unwrap(),
            Authorization::Allowed(_)
        ));
    }

    #[test]
    fn period_bounds_cover_now() {
        let now = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        let (start, end) = period_bounds(BudgetPeriod::Monthly, 1, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());

        // 2026-10-15 is a Thursday.
        let thu = Utc.with_ymd_and_hms(2026, 10, 15, 8, 0, 0).unwrap();
        let (start, end) = period_bounds(BudgetPeriod::Weekly, 1, thu);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap());
        assert_eq!(end - start, Duration::days(7));

        let (start, end) = period_bounds(BudgetPeriod::Daily, 1, thu);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap());
    }

    #[test]
    fn monthly_periods_start_on_the_billing_day() {
        let before = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let (start, end) = period_bounds(BudgetPeriod::Monthly, 15, before);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap());

        let on = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(period_bounds(BudgetPeriod::Monthly, 15, on).0, on);

        // Day 31 falls back to the last day of shorter months.
        let feb = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let (start, end) = period_bounds(BudgetPeriod::Monthly, 31, feb);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap());

        let january = Utc.with_ymd_and_hms(2027, 1, 5, 0, 0, 0).unwrap();
        let (start, end) = period_bounds(BudgetPeriod::Monthly, 20, january);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 20, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 20, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn near_limit_alert_fires_once_per_period() {
        let (_dir, gov) = governor(10.0).await;
        let may = Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).unwrap();
        let june = Utc.with_ymd_and_hms(2026, 6, 2, 9, 0, 0).unwrap();

        let mut alerts = Vec::new();
        for (cost, at) in [(5.0, may), (3.5, may), (0.5, may), (8.0, june)] {
            let Authorization::Allowed(r) = gov.authorize_at("acme", 0.1, at).await.unwrap() else {
                panic!("should be allowed");
            };
            alerts.push(gov.record(r, spend("acme", cost, at)).await.unwrap());
        }

        assert_eq!(alerts[0], None, "50% is under the alert ratio");
        let first = alerts[1].as_ref().expect("crossing 80% raises an alert");
        assert_eq!(first.consumed, 8.5);
        assert_eq!(first.limit, 10.0);
        assert_eq!(first.period_start, Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(alerts[2], None, "already alerted this period");
        let next = alerts[3].as_ref().expect("a new period alerts again");
        assert_eq!(next.period_start, Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
    }
}
