//! Connects to the tenant's own analytical database and runs their query.
//!
//! `db_tns` is treated as a `host[:port][/database]` connection descriptor
//! (the closest analogue available in this stack to the original Oracle TNS
//! string); a fresh connection is opened per query rather than pooled,
//! since each query can carry different credentials.
//!
//! Connecting and fetching both run on the blocking thread pool would be
//! the natural choice for a blocking driver; sqlx's Postgres driver is
//! async end to end, so this module just awaits it directly on the
//! worker's task instead of bouncing through `spawn_blocking`.

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Column, ConnectOptions, Executor, Row};

use crate::export::ResultSet;
use crate::secret::Redacted;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
}

/// Distinguishes a failure to reach the target database at all from a
/// failure of the query text itself, since callers (see
/// [`crate::error::QueryError`]) report the two differently.
#[derive(Debug)]
pub enum TargetError {
    Connect(anyhow::Error),
    Execute(anyhow::Error),
}

/// Parse a `db_tns` value of the form `host`, `host:port`, `host/database`,
/// or `host:port/database`.
pub fn parse_tns(tns: &str) -> anyhow::Result<TargetDescriptor> {
    let (host_port, database) = match tns.split_once('/') {
        Some((hp, db)) => (hp, Some(db.to_string())),
        None => (tns, None),
    };

    let (host, port) = match host_port.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in db_tns `{tns}`"))?;
            (host.to_string(), port)
        }
        None => (host_port.to_string(), 5432),
    };

    if host.is_empty() {
        anyhow::bail!("db_tns `{tns}` has no host component");
    }

    Ok(TargetDescriptor { host, port, database })
}

pub async fn execute(
    db_username: &str,
    db_password: &Redacted<String>,
    db_tns: &str,
    query_text: &str,
) -> Result<ResultSet, TargetError> {
    let descriptor = parse_tns(db_tns).map_err(TargetError::Connect)?;

    let mut options = PgConnectOptions::new()
        .host(&descriptor.host)
        .port(descriptor.port)
        .username(db_username)
        .password(db_password.expose());
    if let Some(database) = &descriptor.database {
        options = options.database(database);
    }

    let mut conn = options
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}:{}", descriptor.host, descriptor.port))
        .map_err(TargetError::Connect)?;

    // Describe the statement up front so the column list comes from the
    // server's own row description rather than the first returned row,
    // which would otherwise be empty (and so would the header) whenever
    // the query matches zero rows.
    let described = conn
        .describe(query_text)
        .await
        .context("failed to describe query")
        .map_err(TargetError::Execute)?;
    let columns: Vec<String> = described
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let rows = sqlx::query(query_text)
        .fetch_all(&mut conn)
        .await
        .context("query execution failed")
        .map_err(TargetError::Execute)?;

    let result_rows = rows
        .iter()
        .map(|row| (0..columns.len()).map(|idx| stringify_cell(row, idx)).collect())
        .collect();

    Ok(ResultSet { columns, rows: result_rows })
}

/// Best-effort conversion of a single cell to display text, trying the
/// common scalar types in turn since the driver does not expose a single
/// "decode to string regardless of type" primitive.
fn stringify_cell(row: &PgRow, idx: usize) -> Option<String> {
    if let Ok(value) = row.try_get::<Option<String>, _>(idx) {
        return value;
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return value.map(|v| v.to_rfc3339());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host() {
        let d = parse_tns("dbhost").unwrap();
        assert_eq!(d, TargetDescriptor { host: "dbhost".into(), port: 5432, database: None });
    }

    #[test]
    fn parses_host_and_port() {
        let d = parse_tns("dbhost:6543").unwrap();
        assert_eq!(d, TargetDescriptor { host: "dbhost".into(), port: 6543, database: None });
    }

    #[test]
    fn parses_host_port_and_database() {
        let d = parse_tns("dbhost:6543/analytics").unwrap();
        assert_eq!(
            d,
            TargetDescriptor {
                host: "dbhost".into(),
                port: 6543,
                database: Some("analytics".into()),
            }
        );
    }

    #[test]
    fn parses_host_and_database_without_port() {
        let d = parse_tns("dbhost/analytics").unwrap();
        assert_eq!(
            d,
            TargetDescriptor {
                host: "dbhost".into(),
                port: 5432,
                database: Some("analytics".into()),
            }
        );
    }

    #[test]
    fn rejects_empty_host() {
        assert!(parse_tns("/analytics").is_err());
    }
}
