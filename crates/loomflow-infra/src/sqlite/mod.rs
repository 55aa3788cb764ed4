//! SQLite storage layer.
//!
//! Run state and artifact implementations backed by SQLite with WAL mode and
//! split read/write connection pools.

pub mod artifact;
pub mod pool;
pub mod run;

use chrono::{DateTime, Utc};
use loomflow_types::error::RepositoryError;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Shared column helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Decode a snake_case enum column through its serde representation.
fn parse_enum<T: serde::de::DeserializeOwned>(value: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {value}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(value: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

/// Map a UNIQUE/PRIMARY KEY violation to `Conflict`, everything else to `Query`.
fn map_write_error(e: sqlx::Error, key: impl FnOnce() -> String) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE") => {
            RepositoryError::Conflict(key())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}
