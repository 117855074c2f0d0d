//! Pulling rows from a remote source through the worker pool.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_common::retry::retry_blocking;
use strata_error::{ErrorCode, ErrorContext, Result, StrataError};
use tracing::debug;

use super::context::ExecContext;
use super::plan::{BatchPoll, PlanNode};
use crate::pool::{WorkContext, WorkHandle, WorkItem, WorkState};
use crate::types::{Row, SchemaRef, TupleBatch};

/// A page request: skip `offset` rows, return at most `max_rows`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub offset: u64,
    pub max_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub rows: Vec<Row>,
    /// No rows exist past this page.
    pub exhausted: bool,
}

/// The capabilities layer: something that can fetch pages of rows.
///
/// `fetch` runs on a pool thread and may block. It should poll
/// `ctx.is_cancelled()` during long waits.
pub trait RowSource: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> SchemaRef;

    fn fetch(&self, request: FetchRequest, ctx: &WorkContext) -> Result<FetchResponse>;
}

type FetchSlot = Arc<Mutex<Option<Result<FetchResponse>>>>;

struct InFlight {
    handle: WorkHandle,
    slot: FetchSlot,
    offset: u64,
}

/// Leaf node that pages through a [`RowSource`].
///
/// At most one fetch is in flight; fetched pages wait in a queue bounded by
/// the query's `max_in_flight_batches`.
pub struct SourceFetchNode {
    source: Arc<dyn RowSource>,
    inflight: Option<InFlight>,
    pages: VecDeque<FetchResponse>,
    next_offset: u64,
    next_row: u64,
    exhausted: bool,
    finished: bool,
}

impl SourceFetchNode {
    pub fn new(source: Arc<dyn RowSource>) -> Self {
        Self {
            source,
            inflight: None,
            pages: VecDeque::new(),
            next_offset: 0,
            next_row: 1,
            exhausted: false,
            finished: false,
        }
    }

    fn harvest(&mut self) -> Result<()> {
        let Some(inflight) = &self.inflight else {
            return Ok(());
        };
        let state = inflight.handle.state();
        if !state.is_finished() {
            return Ok(());
        }
        let result = inflight.slot.lock().take();
        let offset = inflight.offset;
        let error = inflight.handle.error();
        self.inflight = None;

        let response = match result {
            Some(result) => result?,
            None if state == WorkState::Cancelled => {
                return Err(error.unwrap_or_else(|| {
                    StrataError::cancelled(format!("Fetch from '{}' was cancelled", self.source.name()))
                }))
            }
            None => {
                return Err(error.unwrap_or_else(|| {
                    StrataError::internal(format!(
                        "Fetch from '{}' at offset {} produced no result",
                        self.source.name(),
                        offset
                    ))
                }))
            }
        };
        self.next_offset += response.rows.len() as u64;
        self.exhausted = response.exhausted;
        self.pages.push_back(response);
        Ok(())
    }

    fn issue_fetch(&mut self, ctx: &ExecContext) -> Result<()> {
        let page_limit = ctx.max_in_flight_batches().saturating_sub(1).max(1);
        if self.exhausted || self.inflight.is_some() || self.pages.len() >= page_limit {
            return Ok(());
        }
        let request = FetchRequest {
            offset: self.next_offset,
            max_rows: ctx.batch_rows(),
        };
        let slot: FetchSlot = Arc::new(Mutex::new(None));
        let source = self.source.clone();
        let retry = ctx.retry();
        let warnings = ctx.warnings().clone();
        let result_slot = slot.clone();
        let name = format!("fetch:{}@{}", self.source.name(), request.offset);

        let item = WorkItem::new(name.clone(), move |work: &WorkContext| {
            let mut attempts = 0;
            let result = retry_blocking(
                &name,
                retry,
                || !work.is_cancelled(),
                |attempt| {
                    attempts = attempt;
                    work.check_cancelled()?;
                    source.fetch(request, work)
                },
            )
            .map_err(|e| fetch_error(e, source.name(), request.offset, attempts));
            if result.is_ok() && attempts > 1 {
                warnings.add(format!(
                    "Fetch from '{}' at row {} succeeded after {} attempts",
                    source.name(),
                    request.offset + 1,
                    attempts
                ));
            }
            let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
            *result_slot.lock() = Some(result);
            outcome
        });
        let handle = ctx.spawn(item)?;
        debug!(
            target: "queries",
            query_id = %ctx.query_id(),
            source = %self.source.name(),
            offset = request.offset,
            "Issued source fetch"
        );
        self.inflight = Some(InFlight {
            handle,
            slot,
            offset: request.offset,
        });
        Ok(())
    }
}

fn fetch_error(err: StrataError, source: &str, offset: u64, attempts: u32) -> StrataError {
    if err.is_cancellation() || err.code == ErrorCode::SourceFetchFailed {
        return err;
    }
    StrataError::new(
        ErrorCode::SourceFetchFailed,
        format!("Fetch from '{}' failed: {}", source, err.message),
    )
    .with_context(ErrorContext::SourceFetch {
        source_name: source.to_string(),
        first_row: offset + 1,
        attempts,
    })
}

impl PlanNode for SourceFetchNode {
    fn name(&self) -> &str {
        self.source.name()
    }

    fn schema(&self) -> SchemaRef {
        self.source.schema()
    }

    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.issue_fetch(ctx)
    }

    fn poll_batch(&mut self, ctx: &ExecContext) -> Result<BatchPoll> {
        if self.finished {
            return Ok(BatchPoll::Done);
        }
        ctx.check_cancelled()?;
        self.harvest()?;

        loop {
            let Some(mut page) = self.pages.pop_front() else {
                self.issue_fetch(ctx)?;
                return Ok(BatchPoll::NotReady);
            };
            self.issue_fetch(ctx)?;
            if page.rows.is_empty() && !page.exhausted {
                continue;
            }
            // Sources may ignore max_rows; keep batches within capacity
            if page.rows.len() > ctx.batch_rows() {
                let rest = page.rows.split_off(ctx.batch_rows());
                self.pages.push_front(FetchResponse {
                    rows: rest,
                    exhausted: page.exhausted,
                });
                page.exhausted = false;
            }
            let begin_row = self.next_row;
            self.next_row += page.rows.len() as u64;
            self.finished = page.exhausted;
            return Ok(BatchPoll::Ready(TupleBatch::new(
                page.rows,
                begin_row,
                page.exhausted,
            )));
        }
    }

    fn close(&mut self, _ctx: &ExecContext) {
        if let Some(inflight) = self.inflight.take() {
            inflight.handle.cancel();
        }
        self.pages.clear();
    }
}
