//! The lifecycle recorder: the only component allowed to write a query's
//! status. It wraps the store gateway with the fixed-delay retry the
//! ambient error-handling design calls for, so a transient database blip
//! never by itself fails a query that otherwise ran to completion.

use std::time::Duration;

use serde_json::Value;

use crate::store::Store;
use crate::util::retry_fixed;

const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct LifecycleRecorder {
    store: Store,
}

impl LifecycleRecorder {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn mark_running(&self, query_id: i64) -> anyhow::Result<()> {
        retry_fixed(STORE_RETRY_ATTEMPTS, STORE_RETRY_DELAY, || {
            self.store.mark_running(query_id)
        })
        .await
    }

    pub async fn mark_transferring(&self, query_id: i64, metadata: Value) -> anyhow::Result<()> {
        retry_fixed(STORE_RETRY_ATTEMPTS, STORE_RETRY_DELAY, || {
            self.store.mark_transferring(query_id, metadata.clone())
        })
        .await
    }

    pub async fn mark_completed(&self, query_id: i64, metadata: Value) -> anyhow::Result<()> {
        retry_fixed(STORE_RETRY_ATTEMPTS, STORE_RETRY_DELAY, || {
            self.store.mark_completed(query_id, metadata.clone())
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        query_id: i64,
        error_message: &str,
        metadata: Value,
    ) -> anyhow::Result<()> {
        retry_fixed(STORE_RETRY_ATTEMPTS, STORE_RETRY_DELAY, || {
            self.store.mark_failed(query_id, error_message, metadata.clone())
        })
        .await
    }
}
