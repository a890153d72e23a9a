use crate::db;
use crate::error::StorageError;
use crate::model::{AIUsageEvent, UsageOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqlitePool;

/// Append-only record of inference spend plus per-tenant limits.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn append(&self, event: &AIUsageEvent) -> Result<(), StorageError>;

    /// Sum of event costs with `start <= timestamp < end`.
    async fn consumed(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, StorageError>;

    async fn events(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AIUsageEvent>, StorageError>;

    async fn limit_for(&self, tenant_id: &str) -> Result<Option<f64>, StorageError>;

    async fn set_limit(&self, tenant_id: &str, limit: f64) -> Result<(), StorageError>;

    /// Flags `kind` as raised for the tenant's period. Returns false when
    /// it was already flagged.
    async fn mark_alert(
        &self,
        tenant_id: &str,
        period_start: DateTime<Utc>,
        kind: &str,
    ) -> Result<bool, StorageError>;
}

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                user_id TEXT,
                feature TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                cost REAL NOT NULL,
                outcome TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_events_tenant_time
             ON usage_events (tenant_id, timestamp)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tenant_limits (
                tenant_id TEXT PRIMARY KEY,
                limit_amount REAL NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS budget_alerts (
                tenant_id TEXT NOT NULL,
                period_start TEXT NOT NULL,
                kind TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, period_start, kind)
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl UsageLedger for SqliteLedger {
    async fn append(&self, event: &AIUsageEvent) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO usage_events
                (tenant_id, user_id, feature, model, tokens_in, tokens_out, cost, outcome, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&event.tenant_id)
        .bind(&event.user_id)
        .bind(&event.feature)
        .bind(&event.model)
        .bind(event.tokens_in as i64)
        .bind(event.tokens_out as i64)
        .bind(event.cost)
        .bind(event.outcome.as_str())
        .bind(db::timestamp(event.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consumed(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, StorageError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(cost), 0.0) AS consumed FROM usage_events
             WHERE tenant_id = ?1 AND timestamp >= ?2 AND timestamp < ?3",
        )
        .bind(tenant_id)
        .bind(db::timestamp(start))
        .bind(db::timestamp(end))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<f64, _>("consumed")?)
    }

    async fn events(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AIUsageEvent>, StorageError> {
        let rows = sqlx::query(
            "SELECT tenant_id, user_id, feature, model, tokens_in, tokens_out, cost, outcome, timestamp
             FROM usage_events
             WHERE tenant_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
             ORDER BY id",
        )
        .bind(tenant_id)
        .bind(db::timestamp(start))
        .bind(db::timestamp(end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let outcome = match row.try_get::<String, _>("outcome")?.as_str() {
                    "success" => UsageOutcome::Success,
                    "failure" => UsageOutcome::Failure,
                    other => {
                        return Err(StorageError::Corrupt(format!("unknown outcome {}", other)));
                    }
                };
                Ok(AIUsageEvent {
                    tenant_id: row.try_get("tenant_id")?,
                    user_id: row.try_get("user_id")?,
                    feature: row.try_get("feature")?,
                    model: row.try_get("model")?,
                    tokens_in: row.try_get::<i64, _>("tokens_in")? as u32,
                    tokens_out: row.try_get::<i64, _>("tokens_out")? as u32,
                    cost: row.try_get("cost")?,
                    timestamp: db::parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
                    outcome,
                })
            })
            .collect()
    }

    async fn limit_for(&self, tenant_id: &str) -> Result<Option<f64>, StorageError> {
        let row = sqlx::query("SELECT limit_amount FROM tenant_limits WHERE tenant_id = ?1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<f64, _>("limit_amount")?),
            None => None,
        })
    }

    async fn set_limit(&self, tenant_id: &str, limit: f64) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO tenant_limits (tenant_id, limit_amount, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id) DO UPDATE SET
                limit_amount = excluded.limit_amount,
                updated_at = excluded.updated_at",
        )
        .bind(tenant_id)
        .bind(limit)
        .bind(db::timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_alert(
        &self,
        tenant_id: &str,
        period_start: DateTime<Utc>,
        kind: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO budget_alerts (tenant_id, period_start, kind, sent_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(tenant_id)
        .bind(db::timestamp(period_start))
        .bind(kind)
        .bind(db::timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(tenant: &str, cost: f64, at: DateTime<Utc>) -> AIUsageEvent {
        AIUsageEvent {
            tenant_id: tenant.to_string(),
            user_id: Some("u-1".to_string()),
            feature: "selector_inference".to_string(),
            model: "gpt-4o".to_string(),
            tokens_in: 1200,
            tokens_out: 80,
            cost,
            timestamp: at,
            outcome: UsageOutcome::Failure,
        }
    }

    #[tokio::test]
    async fn aggregates_are_rebuilt_from_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(dir.path().join("ledger.db").to_str().unwrap())
            .await
            .unwrap();
        let ledger = SqliteLedger::new(pool).await.unwrap();

        let now = Utc::now();
        ledger.append(&event("acme", 1.5, now)).await.unwrap();
        ledger.append(&event("acme", 2.0, now)).await.unwrap();
        ledger
            .append(&event("acme", 9.0, now - Duration::days(400)))
            .await
            .unwrap();
        ledger.append(&event("other", 4.0, now)).await.unwrap();

        let start = now - Duration::days(1);
        let end = now + Duration::days(1);
        assert_eq!(ledger.consumed("acme", start, end).await.unwrap(), 3.5);

        let events = ledger.events("acme", start, end).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, UsageOutcome::Failure);
        assert_eq!(events[0].tokens_in, 1200);
    }

    #[tokio::test]
    async fn limits_persist_and_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let pool = db::connect(path.to_str().unwrap()).await.unwrap();
            let ledger = SqliteLedger::new(pool).await.unwrap();
            assert_eq!(ledger.limit_for("acme").await.unwrap(), None);
            ledger.set_limit("acme", 50.0).await.unwrap();
            ledger.set_limit("acme", 75.0).await.unwrap();
        }

        let pool = db::connect(path.to_str().unwrap()).await.unwrap();
        let ledger = SqliteLedger::new(pool).await.unwrap();
        assert_eq!(ledger.limit_for("acme").await.unwrap(), Some(75.0));
    }

    #[tokio::test]
    async fn alerts_are_flagged_once_per_period() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(dir.path().join("ledger.db").to_str().unwrap())
            .await
            .unwrap();
        let ledger = SqliteLedger::new(pool).await.unwrap();

        let period = Utc::now();
        assert!(ledger.mark_alert("acme", period, "near_limit").await.unwrap());
        assert!(!ledger.mark_alert("acme", period, "near_limit").await.unwrap());
        assert!(ledger.mark_alert("other", period, "near_limit").await.unwrap());
        assert!(
            ledger
                .mark_alert("acme", period + Duration::days(31), "near_limit")
                .await
                .unwrap()
        );
    }
}
