use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::secret::Redacted;

/// The statuses a [`Query`] can hold.
///
/// `Queued` is retained purely for backward-compatible deserialization of
/// historical rows and as a display-layer concept for the control-plane; the
/// processor itself never writes it (see DESIGN.md).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Queued,
    Running,
    Transferring,
    Completed,
    Failed,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Queued => "queued",
            QueryStatus::Running => "running",
            QueryStatus::Transferring => "transferring",
            QueryStatus::Completed => "completed",
            QueryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueryStatus::Completed | QueryStatus::Failed)
    }

    /// Whether this query occupies one of the scheduler's admission slots.
    pub fn is_active(self) -> bool {
        matches!(self, QueryStatus::Running | QueryStatus::Transferring)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => QueryStatus::Pending,
            "queued" => QueryStatus::Queued,
            "running" => QueryStatus::Running,
            "transferring" => QueryStatus::Transferring,
            "completed" => QueryStatus::Completed,
            "failed" => QueryStatus::Failed,
            other => anyhow::bail!("unrecognized query status `{other}`"),
        })
    }
}

impl sqlx::Type<sqlx::Postgres> for QueryStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for QueryStatus {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let raw = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(raw.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for QueryStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// The export formats a query's result set can be materialised into.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportType {
    Csv,
    Excel,
    Json,
    Feather,
}

impl ExportType {
    pub const ALL: [ExportType; 4] = [
        ExportType::Csv,
        ExportType::Excel,
        ExportType::Json,
        ExportType::Feather,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            ExportType::Csv => "csv",
            ExportType::Excel => "xlsx",
            ExportType::Json => "json",
            ExportType::Feather => "feather",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExportType::Csv => "csv",
            ExportType::Excel => "excel",
            ExportType::Json => "json",
            ExportType::Feather => "feather",
        }
    }
}

impl std::str::FromStr for ExportType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "csv" => ExportType::Csv,
            "excel" | "xlsx" => ExportType::Excel,
            "json" => ExportType::Json,
            "feather" => ExportType::Feather,
            other => anyhow::bail!(
                "unrecognized export type `{other}` (expected one of csv, excel, json, feather)"
            ),
        })
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub hashed_password: Redacted<String>,
    pub is_active: bool,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UserSettings {
    pub id: i64,
    pub user_id: i64,
    pub export_location: Option<String>,
    pub export_type: Option<String>,
    pub max_parallel_queries: Option<i32>,
    pub ssh_hostname: Option<String>,
    pub ssh_port: i32,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<Redacted<String>>,
    pub ssh_key: Option<Redacted<String>>,
    pub ssh_key_passphrase: Option<Redacted<String>>,
}

impl UserSettings {
    /// The per-user admission cap, falling back to the process default when
    /// unset.
    pub fn max_parallel(&self, default_user_max_parallel: usize) -> usize {
        self.max_parallel_queries
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(default_user_max_parallel)
    }

    pub fn export_type(&self) -> Option<ExportType> {
        self.export_type.as_deref().and_then(|s| s.parse().ok())
    }
}

/// The structured outcome fields recorded on a [`Query`] as it progresses.
///
/// Merged into the existing `result_metadata` JSON object on every status
/// update rather than replacing it wholesale (data model invariant 3).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmp_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_file_path: Option<String>,
}

impl ResultMetadata {
    /// Merge `self` into `existing`, overwriting only the keys `self` has
    /// set. Implements data model invariant 3 at the Rust-value level; the
    /// store gateway additionally performs the equivalent merge at the SQL
    /// level so concurrent writers never race on a read-modify-write.
    pub fn merge_into(self, existing: &mut Value) {
        let delta = serde_json::to_value(self).expect("ResultMetadata always serializes");
        let Value::Object(delta) = delta else {
            return;
        };

        if !existing.is_object() {
            *existing = Value::Object(serde_json::Map::new());
        }

        let Value::Object(existing) = existing else {
            unreachable!("just normalized to an object");
        };

        for (key, value) in delta {
            existing.insert(key, value);
        }
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Query {
    pub id: i64,
    pub user_id: i64,

    pub query_text: String,
    pub db_username: String,
    pub db_password: Redacted<String>,
    pub db_tns: String,
    pub export_location: Option<String>,
    pub export_type: Option<String>,
    pub export_filename: Option<String>,
    pub ssh_hostname: Option<String>,

    pub status: QueryStatus,
    pub error_message: Option<String>,
    pub result_metadata: sqlx::types::Json<Value>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Query {
    pub fn export_type(&self) -> Option<ExportType> {
        self.export_type.as_deref().and_then(|s| s.parse().ok())
    }

    /// The inputs that survive into a rerun: everything the user supplied at
    /// creation time, preserved verbatim on the new row (invariant: reruns
    /// never mutate the original).
    pub fn rerun_inputs(&self) -> RerunInputs {
        RerunInputs {
            user_id: self.user_id,
            query_text: self.query_text.clone(),
            db_username: self.db_username.clone(),
            db_password: self.db_password.clone(),
            db_tns: self.db_tns.clone(),
            export_location: self.export_location.clone(),
            export_type: self.export_type.clone(),
            export_filename: self.export_filename.clone(),
            ssh_hostname: self.ssh_hostname.clone(),
        }
    }
}

/// The subset of a [`Query`]'s fields that a rerun preserves on a brand new
/// row, per data model invariant and §8's rerun-isolation property.
#[derive(Clone, Debug, PartialEq)]
pub struct RerunInputs {
    pub user_id: i64,
    pub query_text: String,
    pub db_username: String,
    pub db_password: Redacted<String>,
    pub db_tns: String,
    pub export_location: Option<String>,
    pub export_type: Option<String>,
    pub export_filename: Option<String>,
    pub ssh_hostname: Option<String>,
}

/// Destination precedence, resolved once per query (worker step 5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub export_type: ExportType,
    pub directory: String,
    pub filename: String,
}

impl ResolvedDestination {
    pub fn final_path(&self) -> String {
        format!("{}/{}", self.directory.trim_end_matches('/'), self.filename)
    }
}

/// Counts of currently-active (`running` or `transferring`) queries per user,
/// as seen by the store at a point in time. Used only to seed the scheduler's
/// in-memory admission ledger on startup; during normal operation the ledger
/// is authoritative.
pub type RunningByUser = BTreeMap<i64, usize>;
