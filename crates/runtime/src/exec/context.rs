use std::sync::Arc;

use strata_common::config::{QuerySettings, RetrySettings};
use strata_common::warnings::WarningCollector;
use strata_error::Result;

use super::cancel::CancellationToken;
use crate::buffer::BufferManager;
use crate::pool::{WorkHandle, WorkItem, WorkerPool};

/// Everything a running plan may touch, passed explicitly to every node.
#[derive(Clone)]
pub struct ExecContext {
    query_id: Arc<str>,
    pool: Arc<WorkerPool>,
    buffers: Arc<BufferManager>,
    cancel: CancellationToken,
    warnings: WarningCollector,
    batch_rows: usize,
    max_in_flight_batches: usize,
    retry: RetrySettings,
}

impl ExecContext {
    pub fn new(
        query_id: impl Into<String>,
        pool: Arc<WorkerPool>,
        buffers: Arc<BufferManager>,
    ) -> Self {
        let query = QuerySettings::default();
        Self {
            query_id: Arc::from(query_id.into()),
            pool,
            buffers,
            cancel: CancellationToken::new(),
            warnings: WarningCollector::new(),
            batch_rows: query.batch_rows,
            max_in_flight_batches: query.max_in_flight_batches,
            retry: RetrySettings::default(),
        }
    }

    pub fn with_query_settings(mut self, settings: &QuerySettings) -> Self {
        self.batch_rows = settings.batch_rows.max(1);
        self.max_in_flight_batches = settings.max_in_flight_batches.max(1);
        self
    }

    pub fn with_batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn warnings(&self) -> &WarningCollector {
        &self.warnings
    }

    pub fn batch_rows(&self) -> usize {
        self.batch_rows
    }

    pub fn max_in_flight_batches(&self) -> usize {
        self.max_in_flight_batches
    }

    pub fn retry(&self) -> RetrySettings {
        self.retry
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    /// Run `item` on the pool as work owned by this plan.
    pub fn spawn(&self, item: WorkItem) -> Result<WorkHandle> {
        let handle = self.pool.execute(item)?;
        self.cancel.register(&handle);
        Ok(handle)
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("query_id", &self.query_id)
            .field("batch_rows", &self.batch_rows)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
