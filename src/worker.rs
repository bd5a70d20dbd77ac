//! The query worker: drives one admitted query from `running` through to a
//! terminal state. Runs as an independent spawned task; every failure is
//! captured here and recorded via the lifecycle recorder rather than
//! propagated to the scheduler that spawned it.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::QueryError;
use crate::export::{Exporter, ResultSet};
use crate::lifecycle::LifecycleRecorder;
use crate::models::{ExportType, Query, ResolvedDestination, ResultMetadata, UserSettings};
use crate::store::Store;
use crate::target::{self, TargetError};
use crate::transfer::TransferService;

pub struct QueryWorker {
    query: Query,
    store: Store,
    lifecycle: LifecycleRecorder,
    transfer: Arc<TransferService>,
    exporter: Arc<Exporter>,
    tmp_root: PathBuf,
    default_export_type: ExportType,
    default_export_location: String,
}

impl QueryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query: Query,
        store: Store,
        lifecycle: LifecycleRecorder,
        transfer: Arc<TransferService>,
        exporter: Arc<Exporter>,
        tmp_root: PathBuf,
        default_export_type: ExportType,
        default_export_location: String,
    ) -> Self {
        Self {
            query,
            store,
            lifecycle,
            transfer,
            exporter,
            tmp_root,
            default_export_type,
            default_export_location,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let query_id = self.query.id;

        if let Err(error) = self.lifecycle.mark_running(query_id).await {
            tracing::error!(%error, query_id, "failed to record running state");
        }

        let settings = self.store.user_settings(self.query.user_id).await.ok().flatten();

        match self.execute_and_transfer(settings.as_ref()).await {
            Ok(metadata) => {
                if let Err(error) = self.lifecycle.mark_completed(query_id, metadata).await {
                    tracing::error!(%error, query_id, "failed to record completed state");
                }
            }
            Err(error) => {
                tracing::warn!(%error, query_id, "query failed");
                if let Err(record_error) = self
                    .lifecycle
                    .mark_failed(query_id, &error.user_message(), serde_json::json!({}))
                    .await
                {
                    tracing::error!(error = %record_error, query_id, "failed to record failed state");
                }
            }
        }

        Ok(())
    }

    async fn execute_and_transfer(
        &self,
        settings: Option<&UserSettings>,
    ) -> Result<serde_json::Value, QueryError> {
        let result = target::execute(
            &self.query.db_username,
            &self.query.db_password,
            &self.query.db_tns,
            &self.query.query_text,
        )
        .await
        .map_err(|err| match err {
            TargetError::Connect(source) => QueryError::TargetConnect { source },
            TargetError::Execute(source) => QueryError::TargetExecute { source },
        })?;

        let export_type = self
            .query
            .export_type()
            .or_else(|| settings.and_then(|s| s.export_type()))
            .unwrap_or(self.default_export_type);

        let tmp_filename = format!(
            "query_{}_{}.{}",
            self.query.id,
            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
            export_type.extension()
        );
        let tmp_path = self.tmp_root.join(&tmp_filename);

        let file_size = self
            .exporter
            .write(&result, export_type, &tmp_path)
            .map_err(|source| QueryError::ExportWrite { source })?;

        let destination = self.resolve_destination(export_type, settings)?;

        // Step 4/6: the fields known once the file is materialised are
        // recorded at the `transferring` transition, not just at the end,
        // so a query that later fails mid-delivery still keeps them.
        let transferring_metadata = ResultMetadata {
            rows: Some(result.row_count() as i64),
            columns: Some(result.column_count() as i64),
            column_names: Some(result.columns.clone()),
            file_size: Some(file_size as i64),
            tmp_file_path: Some(tmp_path.to_string_lossy().into_owned()),
            final_file_path: None,
        };
        let mut metadata = serde_json::to_value(&transferring_metadata)
            .expect("ResultMetadata always serializes");

        if let Err(error) = self
            .lifecycle
            .mark_transferring(self.query.id, metadata.clone())
            .await
        {
            tracing::error!(%error, query_id = self.query.id, "failed to record transferring state");
        }

        let transfer_result = self
            .transfer
            .deliver(&tmp_path, &destination, &self.query, settings)
            .await;

        self.transfer.cleanup_tmp(&tmp_path);

        transfer_result.map_err(|source| QueryError::Transfer {
            retryable: source.is_retryable(),
            source: source.into_anyhow(),
        })?;

        ResultMetadata {
            final_file_path: Some(destination.final_path()),
            ..Default::default()
        }
        .merge_into(&mut metadata);

        Ok(metadata)
    }

    /// Precedence for directory: `Query.export_location` > `UserSettings`
    /// > configured default. Precedence for filename: `Query.export_filename`
    /// (extension appended if missing) else `query_{id}_query_{timestamp}.{ext}`.
    fn resolve_destination(
        &self,
        export_type: ExportType,
        settings: Option<&UserSettings>,
    ) -> Result<ResolvedDestination, QueryError> {
        let directory = self
            .query
            .export_location
            .clone()
            .or_else(|| settings.and_then(|s| s.export_location.clone()))
            .unwrap_or_else(|| self.default_export_location.clone());

        if directory.trim().is_empty() {
            return Err(QueryError::DestinationResolution {
                message: "resolved export directory is empty".to_string(),
            });
        }

        let filename = match &self.query.export_filename {
            Some(name) if !name.is_empty() => {
                let ext = format!(".{}", export_type.extension());
                if name.ends_with(&ext) {
                    name.clone()
                } else {
                    format!("{name}{ext}")
                }
            }
            _ => format!(
                "query_{}_query_{}.{}",
                self.query.id,
                chrono::Utc::now().format("%Y%m%d_%H%M%S"),
                export_type.extension()
            ),
        };

        Ok(ResolvedDestination {
            export_type,
            directory,
            filename,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_result_set_reports_shape() {
        let rs = ResultSet {
            columns: vec!["a".into(), "b".into()],
            rows: vec![vec![Some("1".into()), None]],
        };
        assert_eq!(rs.row_count(), 1);
        assert_eq!(rs.column_count(), 2);
    }
}
