//! Row-level data model shared by the buffer manager, the plan executor and
//! the result cache.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
}

impl Value {
    /// Approximate heap footprint in bytes, including the enum itself.
    pub fn estimated_size(&self) -> usize {
        let inline = std::mem::size_of::<Value>();
        match self {
            Value::Utf8(s) => inline + s.capacity(),
            Value::Binary(b) => inline + b.capacity(),
            _ => inline,
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Utf8(_) => Some(DataType::Utf8),
            Value::Binary(_) => Some(DataType::Binary),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

/// A fixed-arity tuple.
pub type Row = Vec<Value>;

/// Approximate heap footprint of a row.
pub fn row_size(row: &Row) -> usize {
    std::mem::size_of::<Row>() + row.iter().map(Value::estimated_size).sum::<usize>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered column list describing every row of a result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RowSchema {
    pub columns: Vec<ColumnDescriptor>,
}

pub type SchemaRef = Arc<RowSchema>;

impl RowSchema {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self { columns }
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn into_ref(self) -> SchemaRef {
        Arc::new(self)
    }
}

/// Inclusive, 1-based range of row numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub begin: u64,
    pub end: u64,
}

impl RowRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> u64 {
        if self.end < self.begin {
            0
        } else {
            self.end - self.begin + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, row: u64) -> bool {
        row >= self.begin && row <= self.end
    }
}

/// An immutable, contiguous slice of a logical result.
///
/// `begin_row` is 1-based. An empty batch has `end_row == begin_row - 1`;
/// the empty result is a single empty terminal batch starting at row 1.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleBatch {
    rows: Arc<Vec<Row>>,
    begin_row: u64,
    terminal: bool,
    warnings: Vec<String>,
}

impl TupleBatch {
    pub fn new(rows: Vec<Row>, begin_row: u64, terminal: bool) -> Self {
        Self {
            rows: Arc::new(rows),
            begin_row: begin_row.max(1),
            terminal,
            warnings: Vec::new(),
        }
    }

    /// The only batch of a result with no rows.
    pub fn empty_terminal() -> Self {
        Self::new(Vec::new(), 1, true)
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn begin_row(&self) -> u64 {
        self.begin_row
    }

    pub fn end_row(&self) -> u64 {
        self.begin_row + self.rows.len() as u64 - 1
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn range(&self) -> RowRange {
        RowRange::new(self.begin_row, self.end_row())
    }

    /// Copy out the rows, sharing nothing with the batch.
    pub fn to_rows(&self) -> Vec<Row> {
        self.rows.as_ref().clone()
    }

    pub fn estimated_size(&self) -> usize {
        self.rows.iter().map(row_size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_terminal_batch_range() {
        let batch = TupleBatch::empty_terminal();
        assert_eq!(batch.begin_row(), 1);
        assert_eq!(batch.end_row(), 0);
        assert!(batch.is_terminal());
        assert!(batch.range().is_empty());
    }

    #[test]
    fn test_batch_end_row() {
        let rows = vec![vec![Value::Int64(1)], vec![Value::Int64(2)]];
        let batch = TupleBatch::new(rows, 11, false);
        assert_eq!(batch.range(), RowRange::new(11, 12));
        assert_eq!(batch.row_count(), 2);
    }

    #[test]
    fn test_size_grows_with_payload() {
        let small = Value::from("a");
        let large = Value::from("a".repeat(1000));
        assert!(large.estimated_size() > small.estimated_size() + 900);
        assert_eq!(Value::Null.data_type(), None);
        assert_eq!(Value::from(true).data_type(), Some(DataType::Boolean));
    }
}
