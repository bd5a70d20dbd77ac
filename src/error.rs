use std::fmt;

/// The taxonomy of failures a [`crate::worker::QueryWorker`] can hit while
/// running a single query end to end.
///
/// Each variant carries enough context to become the `error_message` stored
/// against the query (never a secret: see [`crate::secret::Redacted`]), and
/// [`QueryError::is_retryable`] tells the transfer service whether a failure
/// is worth another attempt.
#[derive(Debug)]
pub enum QueryError {
    /// Could not open a connection to the target analytical database.
    TargetConnect { source: anyhow::Error },
    /// The target database rejected or failed to execute the query text.
    TargetExecute { source: anyhow::Error },
    /// Writing the result set to the chosen export format failed.
    ExportWrite { source: anyhow::Error },
    /// The export destination (local path or SSH target) could not be
    /// resolved from the query, the user's settings, and process defaults.
    DestinationResolution { message: String },
    /// The transfer service could not deliver the file after exhausting its
    /// retry budget.
    Transfer {
        source: anyhow::Error,
        retryable: bool,
    },
}

impl QueryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::Transfer { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// The message recorded on the query row. Deliberately terse: stack
    /// traces and connection strings stay in the logs, not in a user-facing
    /// column.
    pub fn user_message(&self) -> String {
        match self {
            QueryError::TargetConnect { source } => format!("connection error: {source}"),
            QueryError::TargetExecute { source } => format!("query execution failed: {source}"),
            QueryError::ExportWrite { source } => {
                format!("failed to write the export file: {source}")
            }
            QueryError::DestinationResolution { message } => message.clone(),
            QueryError::Transfer { source, .. } => format!("failed to deliver the result: {source}"),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user_message())
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::TargetConnect { source }
            | QueryError::TargetExecute { source }
            | QueryError::ExportWrite { source }
            | QueryError::Transfer { source, .. } => Some(source.as_ref()),
            QueryError::DestinationResolution { .. } => None,
        }
    }
}

/// Errors from the transfer service specifically, distinguishing the one
/// case (remote permission denial) that must never be retried from every
/// other transient failure.
#[derive(Debug)]
pub enum TransferError {
    PermissionDenied { source: anyhow::Error },
    Transient { source: anyhow::Error },
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transient { .. })
    }

    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            TransferError::PermissionDenied { source } => source,
            TransferError::Transient { source } => source,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::PermissionDenied { source } => {
                write!(f, "permission denied: {source}")
            }
            TransferError::Transient { source } => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::PermissionDenied { source } | TransferError::Transient { source } => {
                Some(source.as_ref())
            }
        }
    }
}
