//! Strata Runtime: execution substrate of a federated query engine.
//!
//! This crate turns compiled plans into bounded, memory/disk-tiered streams
//! of row batches.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ ExecutionEngine  │
//! └────────┬─────────┘
//!          │
//!   ┌──────┴───────┬──────────────┐
//!   │ PlanExecutor │ ResultCache  │ (batch/NotReady protocol, memoized results)
//!   └──────┬───────┴──────┬───────┘
//!          │              │
//!   ┌──────┴──────┐ ┌─────┴─────────┐
//!   │ WorkerPool  │ │ BufferManager │ (bounded threads, spill to disk)
//!   └─────────────┘ └───────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use strata_runtime::engine::{ExecutionEngine, ExecutionEngineOptions, QueryRequest};
//! use strata_runtime::exec::ValuesNode;
//! use strata_runtime::types::{ColumnDescriptor, DataType, RowSchema, Value};
//!
//! let engine = ExecutionEngine::new(ExecutionEngineOptions::default());
//! let session = engine.open_session();
//! let schema = RowSchema::new(vec![ColumnDescriptor::new("n", DataType::Int64, false)]).into_ref();
//! let node = ValuesNode::new(schema, vec![vec![Value::Int64(1)]]);
//! let batches = engine
//!     .execute_and_collect(&session, &QueryRequest::new("SELECT 1"), Box::new(node))
//!     .unwrap();
//! assert!(batches[0].is_terminal());
//! ```

pub mod buffer;
pub mod cache;
pub mod engine;
pub mod exec;
pub mod pool;
pub mod types;
