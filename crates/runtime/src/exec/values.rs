use strata_error::{ErrorCode, Result, StrataError};

use super::context::ExecContext;
use super::plan::{BatchPoll, PlanNode};
use crate::types::{Row, SchemaRef, TupleBatch};

/// Emits a fixed list of rows in capacity-bounded batches.
pub struct ValuesNode {
    name: String,
    schema: SchemaRef,
    rows: Vec<Row>,
    position: usize,
    finished: bool,
}

impl ValuesNode {
    pub fn new(schema: SchemaRef, rows: Vec<Row>) -> Self {
        Self {
            name: "values".to_string(),
            schema,
            rows,
            position: 0,
            finished: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl PlanNode for ValuesNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn open(&mut self, _ctx: &ExecContext) -> Result<()> {
        let arity = self.schema.arity();
        if let Some(row) = self.rows.iter().find(|r| r.len() != arity) {
            return Err(StrataError::new(
                ErrorCode::InvalidRow,
                format!("Values row has {} columns, expected {}", row.len(), arity),
            ));
        }
        Ok(())
    }

    fn poll_batch(&mut self, ctx: &ExecContext) -> Result<BatchPoll> {
        if self.finished {
            return Ok(BatchPoll::Done);
        }
        let end = (self.position + ctx.batch_rows()).min(self.rows.len());
        let rows = self.rows[self.position..end].to_vec();
        let begin_row = self.position as u64 + 1;
        self.position = end;
        self.finished = end == self.rows.len();
        Ok(BatchPoll::Ready(TupleBatch::new(rows, begin_row, self.finished)))
    }

    fn close(&mut self, _ctx: &ExecContext) {
        self.rows = Vec::new();
    }
}
