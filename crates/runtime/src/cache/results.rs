use std::sync::Arc;

use strata_error::{ErrorCode, Result, StrataError};

use crate::types::{Row, RowRange, SchemaRef, TupleBatch};

/// A contiguous run of result rows handed to the cache while a query runs.
#[derive(Debug, Clone)]
pub struct PartialResults {
    pub rows: Vec<Row>,
    pub first_row: u64,
    pub schema: SchemaRef,
    pub is_last: bool,
}

impl PartialResults {
    pub fn new(schema: SchemaRef, rows: Vec<Row>, first_row: u64, is_last: bool) -> Self {
        Self {
            rows,
            first_row,
            schema,
            is_last,
        }
    }

    pub fn from_batch(schema: SchemaRef, batch: &TupleBatch) -> Self {
        Self::new(schema, batch.to_rows(), batch.begin_row(), batch.is_terminal())
    }
}

/// Rows memoized for one cache id.
#[derive(Debug, Clone)]
pub struct CacheResults {
    chunks: Vec<Arc<Vec<Row>>>,
    first_row: u64,
    schema: SchemaRef,
    has_all_results: bool,
    size_bytes: usize,
    row_count: u64,
}

impl CacheResults {
    pub fn new(schema: SchemaRef, first_row: u64) -> Self {
        Self {
            chunks: Vec::new(),
            first_row: first_row.max(1),
            schema,
            has_all_results: false,
            size_bytes: 0,
            row_count: 0,
        }
    }

    /// Complete results made of one chunk.
    pub fn from_rows(schema: SchemaRef, rows: Vec<Row>, size_bytes: usize) -> Self {
        let row_count = rows.len() as u64;
        Self {
            chunks: vec![Arc::new(rows)],
            first_row: 1,
            schema,
            has_all_results: true,
            size_bytes,
            row_count,
        }
    }

    /// Append a partial run. It must start right after the last held row.
    pub fn append(&mut self, partial: PartialResults, size_bytes: usize) -> Result<()> {
        if self.has_all_results {
            return Err(StrataError::new(
                ErrorCode::RowRangeOutOfBounds,
                "Cannot append to complete cache results",
            ));
        }
        let expected = self.first_row + self.row_count;
        if partial.first_row != expected {
            return Err(StrataError::new(
                ErrorCode::RowRangeOutOfBounds,
                format!(
                    "Cache results expected row {} but got row {}",
                    expected, partial.first_row
                ),
            ));
        }
        if partial.schema.arity() != self.schema.arity() {
            return Err(StrataError::new(
                ErrorCode::InvalidRow,
                format!(
                    "Cache results have {} columns, partial results have {}",
                    self.schema.arity(),
                    partial.schema.arity()
                ),
            ));
        }
        self.row_count += partial.rows.len() as u64;
        self.size_bytes += size_bytes;
        self.has_all_results = partial.is_last;
        if !partial.rows.is_empty() {
            self.chunks.push(Arc::new(partial.rows));
        }
        Ok(())
    }

    pub fn first_row(&self) -> u64 {
        self.first_row
    }

    /// Last held row; `first_row - 1` when empty.
    pub fn last_row(&self) -> u64 {
        self.first_row + self.row_count - 1
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn has_all_results(&self) -> bool {
        self.has_all_results
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn range(&self) -> RowRange {
        RowRange::new(self.first_row, self.last_row())
    }

    /// True when `range` asks for every held row or more.
    pub fn covers(&self, range: RowRange) -> bool {
        range.begin <= self.first_row && range.end >= self.last_row()
    }

    /// Copy of the held rows inside `range`.
    pub fn rows_in(&self, range: RowRange) -> Vec<Row> {
        let mut rows = Vec::new();
        let mut row = self.first_row;
        for chunk in &self.chunks {
            let chunk_end = row + chunk.len() as u64;
            if chunk_end > range.begin && row <= range.end {
                let from = range.begin.saturating_sub(row) as usize;
                let to = (range.end.saturating_add(1).min(chunk_end) - row) as usize;
                rows.extend_from_slice(&chunk[from..to]);
            }
            row = chunk_end;
            if row > range.end {
                break;
            }
        }
        rows
    }

    /// The part of these results inside `range`, or `None` when they do not
    /// overlap.
    pub fn slice(&self, range: RowRange) -> Option<CacheResults> {
        let begin = range.begin.max(self.first_row);
        let end = range.end.min(self.last_row());
        if range.is_empty() || begin > end {
            return None;
        }
        let rows = self.rows_in(RowRange::new(begin, end));
        let fraction = rows.len() as f64 / self.row_count.max(1) as f64;
        Some(CacheResults {
            chunks: vec![Arc::new(rows)],
            first_row: begin,
            schema: self.schema.clone(),
            has_all_results: self.has_all_results && end == self.last_row(),
            size_bytes: (self.size_bytes as f64 * fraction) as usize,
            row_count: end - begin + 1,
        })
    }

    /// Rows of `range` as a batch; terminal when it reaches the end of a
    /// complete result.
    pub fn batch(&self, range: RowRange) -> TupleBatch {
        let rows = self.rows_in(range);
        let end = range.begin + rows.len() as u64;
        let terminal = self.has_all_results && end > self.last_row();
        TupleBatch::new(rows, range.begin, terminal)
    }
}
