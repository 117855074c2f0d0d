//! Strata Runtime Entry Point.
//!
//! Binary that configures the execution engine and runs a short
//! demonstration workload. It handles:
//! - Configuration loading
//! - Telemetry initialization
//! - Engine instantiation and query execution
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use strata_common::config::AppConfig;
use strata_common::telemetry::init_tracing;
use strata_runtime::engine::{ExecutionEngine, QueryRequest};
use strata_runtime::exec::{
    FetchRequest, FetchResponse, RowSource, SourceFetchNode, SpoolMode, SpoolNode, ValuesNode,
};
use strata_runtime::pool::WorkContext;
use strata_runtime::types::{ColumnDescriptor, DataType, Row, RowSchema, SchemaRef, Value};

/// Pages through a generated table with a little simulated latency.
struct GeneratedSource {
    schema: SchemaRef,
    rows: u64,
}

impl RowSource for GeneratedSource {
    fn name(&self) -> &str {
        "generated"
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn fetch(
        &self,
        request: FetchRequest,
        work: &WorkContext,
    ) -> strata_error::Result<FetchResponse> {
        work.check_cancelled()?;
        let mut rng = rand::thread_rng();
        std::thread::sleep(Duration::from_millis(rng.gen_range(1..5)));
        let end = (request.offset + request.max_rows as u64).min(self.rows);
        let rows: Vec<Row> = (request.offset..end)
            .map(|i| {
                vec![
                    Value::Int64(i as i64),
                    Value::Utf8(format!("customer-{}", i)),
                    Value::Float64(rng.gen_range(0.0..1000.0)),
                ]
            })
            .collect();
        Ok(FetchResponse {
            rows,
            exhausted: end >= self.rows,
        })
    }
}

fn main() -> anyhow::Result<()> {
    // Load configuration to set up telemetry
    let config = AppConfig::from_file("config/strata.yaml").unwrap_or_default();
    init_tracing(&config.telemetry)?;
    tracing::info!("Tracing initialized");

    let engine = ExecutionEngine::from_config(&config);
    let session = engine.open_session();

    let schema = RowSchema::new(vec![
        ColumnDescriptor::new("id", DataType::Int64, false),
        ColumnDescriptor::new("name", DataType::Utf8, true),
    ])
    .into_ref();
    let rows: Vec<Row> = (1..=5)
        .map(|i| vec![Value::Int64(i), Value::from(format!("row {}", i))])
        .collect();
    let request = QueryRequest::new("SELECT id, name FROM demo");

    // The second run is answered by the result cache when it is enabled
    for attempt in 1..=2 {
        let node = ValuesNode::new(schema.clone(), rows.clone());
        let batches = engine
            .execute_and_collect(&session, &request, Box::new(node))
            .context("Demo query failed")?;
        let total: usize = batches.iter().map(|b| b.row_count()).sum();
        tracing::info!(attempt, batches = batches.len(), rows = total, "Demo query complete");
    }

    let source = Arc::new(GeneratedSource {
        schema: RowSchema::new(vec![
            ColumnDescriptor::new("id", DataType::Int64, false),
            ColumnDescriptor::new("customer", DataType::Utf8, false),
            ColumnDescriptor::new("balance", DataType::Float64, false),
        ])
        .into_ref(),
        rows: 50_000,
    });
    let node = SpoolNode::new(Box::new(SourceFetchNode::new(source)), SpoolMode::Streaming);
    let mut handle = engine.execute(
        &session,
        &QueryRequest::new("SELECT * FROM generated").uncached(),
        Box::new(node),
    )?;
    let mut total = 0;
    while let Some(batch) = handle.next_batch()? {
        total += batch.row_count();
    }
    let buffers = session.buffers().stats();
    tracing::info!(
        rows = total,
        spilled_segments = buffers.spilled_segments,
        high_water_bytes = buffers.high_water_bytes,
        "Source query complete"
    );

    let stats = engine.stats();
    tracing::info!(
        submitted = stats.pool.total_submitted,
        completed = stats.pool.total_completed,
        highest_active_threads = stats.pool.highest_active_threads,
        "Worker pool statistics"
    );
    engine.shutdown(Duration::from_secs(5));
    Ok(())
}
