use crate::error::StorageError;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;

pub async fn connect(path: &str) -> Result<SqlitePool, StorageError> {
    let conn_str = format!("sqlite:{}?mode=rwc", path);
    Ok(SqlitePool::connect(&conn_str).await?)
}

/// Fixed-width UTC timestamps so TEXT comparison orders correctly.
pub fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {}: {}", raw, e)))
}
