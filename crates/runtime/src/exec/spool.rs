use strata_error::Result;
use tracing::debug;

use super::context::ExecContext;
use super::plan::{BatchPoll, PlanExecutor, PlanNode};
use crate::buffer::BufferId;
use crate::types::{RowRange, SchemaRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolMode {
    /// Serve rows as soon as they are buffered.
    Streaming,
    /// Drain the child completely before serving the first row.
    Materialize,
}

/// Hands every child batch to a tuple buffer immediately and serves output
/// from the buffer, so in-flight memory stays bounded whatever the result
/// size. Large results spill with the buffer.
pub struct SpoolNode {
    child: PlanExecutor,
    mode: SpoolMode,
    buffer: Option<BufferId>,
    child_done: bool,
    next_row: u64,
    finished: bool,
    cap_warned: bool,
}

impl SpoolNode {
    pub fn new(child: Box<dyn PlanNode>, mode: SpoolMode) -> Self {
        Self {
            child: PlanExecutor::nested(child),
            mode,
            buffer: None,
            child_done: false,
            next_row: 1,
            finished: false,
            cap_warned: false,
        }
    }

    pub fn buffer_id(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Move child batches into the buffer until the child stalls. Streaming
    /// stops after `max_in_flight_batches` so rows reach the caller early.
    fn pull(&mut self, ctx: &ExecContext, buffer: BufferId) -> Result<()> {
        let limit = match self.mode {
            SpoolMode::Streaming => ctx.max_in_flight_batches(),
            SpoolMode::Materialize => usize::MAX,
        };
        for _ in 0..limit {
            if self.child_done {
                break;
            }
            ctx.check_cancelled()?;
            match self.child.next_batch()? {
                BatchPoll::Ready(batch) => {
                    let terminal = batch.is_terminal();
                    if !batch.is_empty() {
                        ctx.buffers().add_rows(buffer, batch.to_rows())?;
                        self.warn_if_over_cap(ctx, buffer);
                    }
                    if terminal {
                        self.finish_child(ctx, buffer)?;
                    }
                }
                BatchPoll::Done => self.finish_child(ctx, buffer)?,
                BatchPoll::NotReady => break,
            }
        }
        Ok(())
    }

    fn warn_if_over_cap(&mut self, ctx: &ExecContext, buffer: BufferId) {
        if self.cap_warned || !ctx.buffers().is_over_cap() {
            return;
        }
        self.cap_warned = true;
        ctx.warnings().add(format!(
            "Spool buffer {} exceeds the {} byte memory cap with nothing left to spill",
            buffer,
            ctx.buffers().options().memory_cap_bytes
        ));
    }

    fn finish_child(&mut self, ctx: &ExecContext, buffer: BufferId) -> Result<()> {
        self.child_done = true;
        let rows = ctx.buffers().mark_complete(buffer)?;
        debug!(
            target: "queries",
            query_id = %ctx.query_id(),
            buffer_id = %buffer,
            rows,
            "Spool input complete"
        );
        self.child.close();
        Ok(())
    }
}

impl PlanNode for SpoolNode {
    fn name(&self) -> &str {
        "spool"
    }

    fn schema(&self) -> SchemaRef {
        self.child.schema()
    }

    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.child.open(ctx.clone())?;
        self.buffer = Some(ctx.buffers().create_buffer(self.child.schema()));
        Ok(())
    }

    fn poll_batch(&mut self, ctx: &ExecContext) -> Result<BatchPoll> {
        if self.finished {
            return Ok(BatchPoll::Done);
        }
        let Some(buffer) = self.buffer else {
            return Ok(BatchPoll::Done);
        };
        self.pull(ctx, buffer)?;
        if self.mode == SpoolMode::Materialize && !self.child_done {
            return Ok(BatchPoll::NotReady);
        }

        let available = ctx.buffers().row_count(buffer)?;
        if self.next_row <= available {
            let end = (self.next_row + ctx.batch_rows() as u64 - 1).min(available);
            let batch = ctx
                .buffers()
                .get_batch(buffer, RowRange::new(self.next_row, end))?;
            self.next_row = end + 1;
            self.finished = batch.is_terminal();
            return Ok(BatchPoll::Ready(batch));
        }
        if self.child_done {
            // Everything served; close the result with an empty terminal batch.
            let batch = ctx
                .buffers()
                .get_batch(buffer, RowRange::new(self.next_row, self.next_row - 1))?;
            self.finished = true;
            return Ok(BatchPoll::Ready(batch));
        }
        Ok(BatchPoll::NotReady)
    }

    fn close(&mut self, ctx: &ExecContext) {
        self.child.close();
        if let Some(buffer) = self.buffer.take() {
            ctx.buffers().release_buffer(buffer);
        }
    }
}
