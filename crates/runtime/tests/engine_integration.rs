use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_common::config::AppConfig;
use strata_error::{ErrorCode, Result, StrataError};
use strata_runtime::buffer::{BufferManager, BufferManagerOptions};
use strata_runtime::cache::{CacheId, CacheResults, CacheStore};
use strata_runtime::engine::{ExecutionEngine, ExecutionEngineOptions, QueryRequest};
use strata_runtime::exec::{
    BatchPoll, DriverOptions, ExecContext, PlanDriver, PlanExecutor, PlanNode, SpoolMode,
    SpoolNode, ValuesNode,
};
use strata_runtime::pool::{WorkerPool, WorkerPoolOptions};
use strata_runtime::types::{ColumnDescriptor, DataType, Row, RowSchema, SchemaRef, Value};

fn schema() -> SchemaRef {
    RowSchema::new(vec![ColumnDescriptor::new("n", DataType::Int64, false)]).into_ref()
}

fn rows(n: i64) -> Vec<Row> {
    (1..=n).map(|i| vec![Value::Int64(i)]).collect()
}

/// Values node that records how often it was opened.
struct CountingNode {
    inner: ValuesNode,
    opens: Arc<AtomicUsize>,
}

impl PlanNode for CountingNode {
    fn name(&self) -> &str {
        "counting"
    }

    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }

    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(ctx)
    }

    fn poll_batch(&mut self, ctx: &ExecContext) -> Result<BatchPoll> {
        self.inner.poll_batch(ctx)
    }

    fn close(&mut self, ctx: &ExecContext) {
        self.inner.close(ctx)
    }
}

/// Never produces anything.
struct StalledNode;

impl PlanNode for StalledNode {
    fn name(&self) -> &str {
        "stalled"
    }

    fn schema(&self) -> SchemaRef {
        schema()
    }

    fn open(&mut self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }

    fn poll_batch(&mut self, _ctx: &ExecContext) -> Result<BatchPoll> {
        Ok(BatchPoll::NotReady)
    }

    fn close(&mut self, _ctx: &ExecContext) {}
}

fn engine() -> ExecutionEngine {
    let mut config = AppConfig::default();
    config.cache.enabled = true;
    config.pool.max_threads = 2;
    config.query.batch_rows = 16;
    ExecutionEngine::new(ExecutionEngineOptions::from_config(&config))
}

#[test]
fn test_rerun_is_served_from_cache() -> anyhow::Result<()> {
    let engine = engine();
    let session = engine.open_session();
    let opens = Arc::new(AtomicUsize::new(0));
    let request = QueryRequest::new("SELECT n FROM numbers");

    let mut results = Vec::new();
    for _ in 0..2 {
        let node = CountingNode {
            inner: ValuesNode::new(schema(), rows(100)),
            opens: opens.clone(),
        };
        let batches = engine.execute_and_collect(&session, &request, Box::new(node))?;
        let all: Vec<Row> = batches.iter().flat_map(|b| b.to_rows()).collect();
        results.push(all);
    }

    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(results[0], rows(100));
    assert_eq!(results[0], results[1]);
    let cache = engine.stats().cache.expect("cache enabled");
    assert_eq!(cache.entries, 1);
    assert!(cache.hits >= 1);

    // Another session has its own connection scope
    let other = engine.open_session();
    let node = CountingNode {
        inner: ValuesNode::new(schema(), rows(100)),
        opens: opens.clone(),
    };
    engine.execute_and_collect(&other, &request, Box::new(node))?;
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    Ok(())
}

/// Store that fails every operation.
struct OfflineStore;

impl CacheStore for OfflineStore {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn get(&self, _id: &CacheId) -> Result<Option<Arc<CacheResults>>> {
        Err(StrataError::new(ErrorCode::CacheStoreFailed, "store offline"))
    }

    fn put(&self, _id: CacheId, _results: Arc<CacheResults>) -> Result<()> {
        Err(StrataError::new(ErrorCode::CacheStoreFailed, "store offline"))
    }

    fn remove(&self, _id: &CacheId) -> Result<bool> {
        Err(StrataError::new(ErrorCode::CacheStoreFailed, "store offline"))
    }

    fn contains(&self, _id: &CacheId) -> bool {
        false
    }

    fn clear(&self) -> Result<()> {
        Err(StrataError::new(ErrorCode::CacheStoreFailed, "store offline"))
    }

    fn len(&self) -> usize {
        0
    }
}

#[test]
fn test_failing_cache_store_runs_plan_live() -> anyhow::Result<()> {
    let mut config = AppConfig::default();
    config.query.batch_rows = 16;
    let engine = ExecutionEngine::with_cache_store(
        ExecutionEngineOptions::from_config(&config),
        Arc::new(OfflineStore),
    );
    let session = engine.open_session();
    let opens = Arc::new(AtomicUsize::new(0));
    let request = QueryRequest::new("SELECT n FROM numbers");
    for _ in 0..2 {
        let node = CountingNode {
            inner: ValuesNode::new(schema(), rows(100)),
            opens: opens.clone(),
        };
        let batches = engine.execute_and_collect(&session, &request, Box::new(node))?;
        let all: Vec<Row> = batches.iter().flat_map(|b| b.to_rows()).collect();
        assert_eq!(all, rows(100));
    }

    assert_eq!(opens.load(Ordering::SeqCst), 2);
    let cache = engine.stats().cache.expect("cache configured");
    assert_eq!(cache.hits, 0);
    assert_eq!(cache.entries, 0);
    Ok(())
}

#[test]
fn test_oversized_result_warns_on_batches() -> anyhow::Result<()> {
    let mut config = AppConfig::default();
    config.cache.enabled = true;
    config.cache.max_size_bytes = 512;
    config.query.batch_rows = 16;
    let engine = ExecutionEngine::from_config(&config);
    let session = engine.open_session();
    let request = QueryRequest::new("SELECT n FROM big");

    let batches = engine.execute_and_collect(
        &session,
        &request,
        Box::new(ValuesNode::new(schema(), rows(200))),
    )?;
    let warnings: Vec<&String> = batches.iter().flat_map(|b| b.warnings()).collect();
    assert_eq!(warnings.len(), 1, "{:?}", warnings);
    assert!(warnings[0].contains("cache size budget"));

    // The rerun knows the id is poisoned and says so up front
    let batches = engine.execute_and_collect(
        &session,
        &request,
        Box::new(ValuesNode::new(schema(), rows(200))),
    )?;
    assert!(batches[0].warnings().iter().any(|w| w.contains("cache size budget")));
    assert_eq!(batches.iter().map(|b| b.row_count()).sum::<usize>(), 200);
    Ok(())
}

#[test]
fn test_uncached_requests_always_run() -> anyhow::Result<()> {
    let engine = engine();
    let session = engine.open_session();
    let opens = Arc::new(AtomicUsize::new(0));
    let request = QueryRequest::new("SELECT n FROM numbers").uncached();
    for _ in 0..2 {
        let node = CountingNode {
            inner: ValuesNode::new(schema(), rows(3)),
            opens: opens.clone(),
        };
        engine.execute_and_collect(&session, &request, Box::new(node))?;
    }
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn test_deadline_cancels_with_timeout() -> anyhow::Result<()> {
    let pool = Arc::new(WorkerPool::new(WorkerPoolOptions {
        name: "deadline".into(),
        max_threads: 1,
    }));
    let buffers = Arc::new(BufferManager::new(BufferManagerOptions::default()));
    let mut plan = PlanExecutor::new(Box::new(StalledNode));
    plan.open(ExecContext::new("q-deadline", pool, buffers))?;

    let start = Instant::now();
    let handle = PlanDriver::new(plan)
        .with_options(DriverOptions {
            poll_interval: Duration::from_millis(2),
            timeout: Some(Duration::from_millis(60)),
            batches_per_step: 4,
        })
        .spawn()?;
    let err = handle.collect().unwrap_err();
    assert_eq!(err.code, ErrorCode::QueryTimeout);
    assert!(start.elapsed() >= Duration::from_millis(60));
    assert!(start.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn test_dropping_handle_cancels_query() -> anyhow::Result<()> {
    let engine = engine();
    let session = engine.open_session();
    let handle = engine.execute(
        &session,
        &QueryRequest::new("SELECT stalled").uncached(),
        Box::new(StalledNode),
    )?;
    assert_eq!(engine.active_queries(), 1);
    drop(handle);

    let deadline = Instant::now() + Duration::from_secs(2);
    while engine.active_queries() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(engine.active_queries(), 0);
    Ok(())
}

#[test]
fn test_spooled_query_releases_session_buffers() -> anyhow::Result<()> {
    let engine = engine();
    let session = engine.open_session();
    let node = SpoolNode::new(
        Box::new(ValuesNode::new(schema(), rows(500))),
        SpoolMode::Materialize,
    );
    let mut handle = engine.execute(&session, &QueryRequest::new("SELECT spooled").uncached(), Box::new(node))?;
    let mut total = 0;
    while let Some(batch) = handle.next_batch()? {
        assert!(batch.row_count() <= 16);
        total += batch.row_count();
    }
    assert_eq!(total, 500);

    let deadline = Instant::now() + Duration::from_secs(2);
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(handle.is_finished());
    assert_eq!(session.buffers().stats().buffers, 0);
    Ok(())
}
