use crate::config::PatternConfig;
use crate::db;
use crate::error::StorageError;
use crate::model::{SelectorPattern, SiteSignature};
use crate::selector::{CssSelector, SelectorStability};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternEvent {
    /// A validated pattern was written, new or replacing an older one.
    Learned,
    /// Consecutive failures reached the eviction threshold.
    Expired,
    /// Removed by an operator.
    Evicted,
}

impl PatternEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternEvent::Learned => "learned",
            PatternEvent::Expired => "expired",
            PatternEvent::Evicted => "evicted",
        }
    }

    fn parse(raw: &str) -> Result<Self, StorageError> {
        match raw {
            "learned" => Ok(PatternEvent::Learned),
            "expired" => Ok(PatternEvent::Expired),
            "evicted" => Ok(PatternEvent::Evicted),
            other => Err(StorageError::Corrupt(format!("unknown pattern event {}", other))),
        }
    }
}

impl fmt::Display for PatternEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One row of the append-only pattern audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternHistoryEntry {
    pub signature: String,
    pub event: PatternEvent,
    pub container: String,
    pub confidence: f64,
    pub stability: SelectorStability,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Live pattern for the signature; evicted or failing-out patterns are a miss.
    async fn lookup(&self, signature: &SiteSignature)
    -> Result<Option<SelectorPattern>, StorageError>;

    /// Writes a validated pattern and logs it as learned.
    async fn upsert(&self, pattern: &SelectorPattern) -> Result<(), StorageError>;

    /// Successful reuse: bumps the hit counter, confidence unchanged.
    async fn record_hit(&self, signature: &SiteSignature) -> Result<(), StorageError>;

    /// Failed validation: decays confidence and counts the failure.
    /// Returns `(confidence, consecutive_failures)` after the update.
    async fn degrade(&self, signature: &SiteSignature)
    -> Result<Option<(f64, u32)>, StorageError>;

    async fn evict(&self, signature: &SiteSignature) -> Result<bool, StorageError>;

    /// Every stored pattern, including evicted ones.
    async fn list(&self) -> Result<Vec<SelectorPattern>, StorageError>;

    /// Audit log, oldest first; all signatures when `signature` is `None`.
    async fn history(
        &self,
        signature: Option<&SiteSignature>,
    ) -> Result<Vec<PatternHistoryEntry>, StorageError>;
}

pub struct SqlitePatternStore {
    pool: SqlitePool,
    config: PatternConfig,
}

const COLUMNS: &str = "host, path_template, layout_hash, container, fields, next_page, \
                       confidence, consecutive_failures, hits, last_validated_at";

impl SqlitePatternStore {
    pub async fn new(pool: SqlitePool, config: PatternConfig) -> Result<Self, StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS selector_patterns (
                signature TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                path_template TEXT NOT NULL,
                layout_hash TEXT NOT NULL,
                container TEXT NOT NULL,
                fields TEXT NOT NULL,
                next_page TEXT,
                confidence REAL NOT NULL,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                hits INTEGER NOT NULL DEFAULT 0,
                evicted INTEGER NOT NULL DEFAULT 0,
                last_validated_at TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pattern_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signature TEXT NOT NULL,
                event TEXT NOT NULL,
                container TEXT NOT NULL,
                confidence REAL NOT NULL,
                stability TEXT NOT NULL,
                reason TEXT,
                recorded_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, config })
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }
}

async fn log_event(
    conn: &mut SqliteConnection,
    signature: &SiteSignature,
    event: PatternEvent,
    container: &CssSelector,
    confidence: f64,
    reason: Option<String>,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO pattern_history
            (signature, event, container, confidence, stability, reason, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(signature.key())
    .bind(event.as_str())
    .bind(container.to_css_string())
    .bind(confidence)
    .bind(container.stability().to_string())
    .bind(reason)
    .bind(db::timestamp(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

fn row_to_history(row: &SqliteRow) -> Result<PatternHistoryEntry, StorageError> {
    let stability = match row.try_get::<String, _>("stability")?.as_str() {
        "stable" => SelectorStability::Stable,
        _ => SelectorStability::Fragile,
    };
    Ok(PatternHistoryEntry {
        signature: row.try_get("signature")?,
        event: PatternEvent::parse(&row.try_get::<String, _>("event")?)?,
        container: row.try_get("container")?,
        confidence: row.try_get("confidence")?,
        stability,
        reason: row.try_get("reason")?,
        recorded_at: db::parse_timestamp(&row.try_get::<String, _>("recorded_at")?)?,
    })
}

fn row_to_pattern(row: &SqliteRow) -> Result<SelectorPattern, StorageError> {
    let last_validated_at = row
        .try_get::<Option<String>, _>("last_validated_at")?
        .map(|raw| db::parse_timestamp(&raw))
        .transpose()?;

    Ok(SelectorPattern {
        signature: SiteSignature {
            host: row.try_get("host")?,
            path_template: row.try_get("path_template")?,
            layout_hash: row.try_get("layout_hash")?,
        },
        container: serde_json::from_str(&row.try_get::<String, _>("container")?)?,
        fields: serde_json::from_str(&row.try_get::<String, _>("fields")?)?,
        next_page: row
            .try_get::<Option<String>, _>("next_page")?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        confidence: row.try_get("confidence")?,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        hits: row.try_get::<i64, _>("hits")? as u64,
        last_validated_at,
    })
}

#[async_trait]
impl PatternStore for SqlitePatternStore {
    async fn lookup(
        &self,
        signature: &SiteSignature,
    ) -> Result<Option<SelectorPattern>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM selector_patterns
             WHERE signature = ?1 AND evicted = 0 AND consecutive_failures < ?2"
        ))
        .bind(signature.key())
        .bind(self.config.eviction_threshold as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_pattern).transpose()
    }

    async fn upsert(&self, pattern: &SelectorPattern) -> Result<(), StorageError> {
        let sig = &pattern.signature;
        let confidence = pattern.confidence.clamp(0.0, 1.0);
        let next_page = pattern
            .next_page
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO selector_patterns
                (signature, host, path_template, layout_hash, container, fields, next_page,
                 confidence, consecutive_failures, hits, evicted, last_validated_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12)
             ON CONFLICT(signature) DO UPDATE SET
                container = excluded.container,
                fields = excluded.fields,
                next_page = excluded.next_page,
                confidence = excluded.confidence,
                consecutive_failures = excluded.consecutive_failures,
                hits = excluded.hits,
                evicted = 0,
                last_validated_at = excluded.last_validated_at,
                updated_at = excluded.updated_at",
        )
        .bind(sig.key())
        .bind(&sig.host)
        .bind(&sig.path_template)
        .bind(&sig.layout_hash)
        .bind(serde_json::to_string(&pattern.container)?)
        .bind(serde_json::to_string(&pattern.fields)?)
        .bind(next_page)
        .bind(confidence)
        .bind(pattern.consecutive_failures as i64)
        .bind(pattern.hits as i64)
        .bind(pattern.last_validated_at.map(db::timestamp))
        .bind(db::timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;
        log_event(&mut tx, sig, PatternEvent::Learned, &pattern.container, confidence, None).await?;
        tx.commit().await?;

        log::debug!(
            "Stored {} pattern for {} (confidence {:.2})",
            pattern.stability(),
            sig,
            confidence
        );
        Ok(())
    }

    async fn record_hit(&self, signature: &SiteSignature) -> Result<(), StorageError> {
        let now = db::timestamp(Utc::now());
        sqlx::query(
            "UPDATE selector_patterns
             SET hits = hits + 1, consecutive_failures = 0,
                 last_validated_at = ?2, updated_at = ?2
             WHERE signature = ?1",
        )
        .bind(signature.key())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn degrade(
        &self,
        signature: &SiteSignature,
    ) -> Result<Option<(f64, u32)>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE selector_patterns
             SET confidence = MIN(confidence, confidence * ?2),
                 consecutive_failures = consecutive_failures + 1,
                 updated_at = ?3
             WHERE signature = ?1
             RETURNING container, confidence, consecutive_failures",
        )
        .bind(signature.key())
        .bind(self.config.decay_factor)
        .bind(db::timestamp(Utc::now()))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let container: CssSelector = serde_json::from_str(&row.try_get::<String, _>("container")?)?;
        let confidence: f64 = row.try_get("confidence")?;
        let failures = row.try_get::<i64, _>("consecutive_failures")? as u32;

        // Logged once, on the failure that crosses the threshold.
        if failures == self.config.eviction_threshold {
            let reason = format!("{} consecutive failures", failures);
            log_event(&mut tx, signature, PatternEvent::Expired, &container, confidence, Some(reason))
                .await?;
        }
        tx.commit().await?;

        if failures >= self.config.eviction_threshold {
            log::warn!(
                "Pattern for {} reached {} consecutive failures; treating as evicted",
                signature,
                failures
            );
        } else {
            log::debug!(
                "Degraded pattern for {} to confidence {:.3} ({} failures)",
                signature,
                confidence,
                failures
            );
        }
        Ok(Some((confidence, failures)))
    }

    async fn evict(&self, signature: &SiteSignature) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE selector_patterns SET evicted = 1, updated_at = ?2 WHERE signature = ?1
             RETURNING container, confidence",
        )
        .bind(signature.key())
        .bind(db::timestamp(Utc::now()))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else { return Ok(false) };
        let container: CssSelector = serde_json::from_str(&row.try_get::<String, _>("container")?)?;
        let confidence: f64 = row.try_get("confidence")?;
        log_event(
            &mut tx,
            signature,
            PatternEvent::Evicted,
            &container,
            confidence,
            Some("manual".to_string()),
        )
        .await?;
        tx.commit().await?;

        log::info!("Evicted pattern for {}", signature);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<SelectorPattern>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM selector_patterns ORDER BY host, path_template"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_pattern).collect()
    }

    async fn history(
        &self,
        signature: Option<&SiteSignature>,
    ) -> Result<Vec<PatternHistoryEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT signature, event, container, confidence, stability, reason, recorded_at
             FROM pattern_history
             WHERE ?1 IS NULL OR signature = ?1
             ORDER BY id",
        )
        .bind(signature.map(|s| s.key()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_history).collect()
    }
}
