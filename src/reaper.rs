//! The startup stuck-query reaper: the processor is single-writer and
//! keeps no durable record of which process owns a running query, so any
//! row still `running`/`transferring` when a new process starts is, by
//! definition, abandoned by the process that crashed mid-flight.

use crate::lifecycle::LifecycleRecorder;
use crate::store::Store;

const RESTART_MESSAGE: &str = "query was interrupted by a processor restart";

pub struct Reaper {
    store: Store,
    lifecycle: LifecycleRecorder,
}

impl Reaper {
    pub fn new(store: Store, lifecycle: LifecycleRecorder) -> Self {
        Self { store, lifecycle }
    }

    /// Fail every `running`/`transferring` row unconditionally. Call once,
    /// before the scheduler starts ticking.
    pub async fn reconcile_on_startup(&self) -> anyhow::Result<usize> {
        let stuck = self.store.find_stuck(std::time::Duration::ZERO).await?;
        self.fail_all(&stuck).await;
        Ok(stuck.len())
    }

    /// Periodic variant for deployments that want an ongoing sweep in
    /// addition to the startup reconciliation, catching queries a worker
    /// task silently died on without the process itself restarting.
    pub async fn sweep(&self, threshold: std::time::Duration) -> anyhow::Result<usize> {
        let stuck = self.store.find_stuck(threshold).await?;
        self.fail_all(&stuck).await;
        Ok(stuck.len())
    }

    async fn fail_all(&self, stuck: &[crate::models::Query]) {
        for query in stuck {
            if let Err(error) = self
                .lifecycle
                .mark_failed(query.id, RESTART_MESSAGE, serde_json::json!({}))
                .await
            {
                tracing::error!(%error, query_id = query.id, "failed to reap stuck query");
            }
        }
    }
}
