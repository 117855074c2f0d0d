//! Execution engine façade.
//!
//! The `ExecutionEngine` is the explicitly constructed owner of everything a
//! query needs. It holds:
//!
//! 1. **Worker pool**: one bounded pool shared by every session.
//! 2. **Result cache**: optional, shared, with a memory or buffer-backed store.
//! 3. **Sessions**: each [`Session`] owns the buffer manager its plans spill
//!    into; dropping the session reclaims its buffers.
//!
//! # Query Lifecycle
//!
//! 1. `execute(session, request, node)` called.
//! 2. **Caching**: cacheable requests are fingerprinted and the node wrapped
//!    in a [`CachingNode`].
//! 3. **Open**: the root [`PlanExecutor`] opens on a fresh [`ExecContext`].
//! 4. **Drive**: a [`PlanDriver`] polls the plan on the pool and streams
//!    batches to the returned [`QueryHandle`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_common::config::{
    AppConfig, CacheBackend, CacheScope, QuerySettings, RetrySettings,
};
use strata_error::Result;
use tracing::{info, warn};

use crate::buffer::{BufferManager, BufferManagerOptions};
use crate::cache::{
    BufferBackedStore, CacheId, CacheStats, CacheStore, CachingNode, MemoryStore, ResultCache,
    ResultCacheOptions, ScopeKey,
};
use crate::exec::{DriverOptions, ExecContext, PlanDriver, PlanExecutor, PlanNode, QueryHandle};
use crate::pool::{PoolStats, Termination, WorkerPool, WorkerPoolOptions};
use crate::types::{TupleBatch, Value};

#[derive(Debug, Clone)]
pub struct ExecutionEngineOptions {
    pub pool: WorkerPoolOptions,
    pub buffer: BufferManagerOptions,
    pub cache_enabled: bool,
    pub cache_backend: CacheBackend,
    pub cache: ResultCacheOptions,
    pub query: QuerySettings,
    pub retry: RetrySettings,
}

impl Default for ExecutionEngineOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl ExecutionEngineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            pool: WorkerPoolOptions::from(&config.pool),
            buffer: BufferManagerOptions::from(&config.buffer),
            cache_enabled: config.cache.enabled,
            cache_backend: config.cache.backend,
            cache: ResultCacheOptions::from(&config.cache),
            query: config.query.clone(),
            retry: config.retry,
        }
    }
}

/// A client connection. Plans run on behalf of a session spill into its
/// buffer manager.
#[derive(Debug, Clone)]
pub struct Session {
    id: u64,
    vdb: Option<(String, String)>,
    buffers: Arc<BufferManager>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Virtual database name and version this session is bound to.
    pub fn vdb(&self) -> Option<(&str, &str)> {
        self.vdb.as_ref().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub sql: String,
    pub params: Vec<Value>,
    pub cacheable: bool,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            cacheable: true,
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub active_queries: usize,
    pub pool: PoolStats,
    pub cache: Option<CacheStats>,
}

pub struct ExecutionEngine {
    pool: Arc<WorkerPool>,
    cache: Option<Arc<ResultCache>>,
    options: ExecutionEngineOptions,
    active_queries: Arc<AtomicUsize>,
    next_session: AtomicU64,
    next_query: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(options: ExecutionEngineOptions) -> Self {
        let store = options.cache_enabled.then(|| {
            let store: Arc<dyn CacheStore> = match options.cache_backend {
                CacheBackend::Memory => Arc::new(MemoryStore::new()),
                CacheBackend::Buffer => Arc::new(BufferBackedStore::new(Arc::new(
                    BufferManager::new(options.buffer.clone()),
                ))),
            };
            store
        });
        Self::build(options, store)
    }

    /// Engine whose result cache keeps entries in `store`, whatever
    /// `cache_enabled` and `cache_backend` say.
    pub fn with_cache_store(options: ExecutionEngineOptions, store: Arc<dyn CacheStore>) -> Self {
        Self::build(options, Some(store))
    }

    fn build(options: ExecutionEngineOptions, store: Option<Arc<dyn CacheStore>>) -> Self {
        let pool = Arc::new(WorkerPool::new(options.pool.clone()));
        let cache = store.map(|store| Arc::new(ResultCache::new(options.cache.clone(), store)));
        info!(
            pool = %options.pool.name,
            max_threads = options.pool.max_threads,
            cache_enabled = cache.is_some(),
            "Execution engine ready"
        );
        Self {
            pool,
            cache,
            options,
            active_queries: Arc::new(AtomicUsize::new(0)),
            next_session: AtomicU64::new(1),
            next_query: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(ExecutionEngineOptions::from_config(config))
    }

    pub fn options(&self) -> &ExecutionEngineOptions {
        &self.options
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    pub fn active_queries(&self) -> usize {
        self.active_queries.load(Ordering::Relaxed)
    }

    pub fn open_session(&self) -> Session {
        Session {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            vdb: None,
            buffers: Arc::new(BufferManager::new(self.options.buffer.clone())),
        }
    }

    /// Session bound to a virtual database, so schema-scoped cache entries
    /// are shared with other sessions on the same version.
    pub fn open_vdb_session(&self, vdb: impl Into<String>, version: impl Into<String>) -> Session {
        Session {
            vdb: Some((vdb.into(), version.into())),
            ..self.open_session()
        }
    }

    /// Open `node` as the root of a query and start driving it on the pool.
    pub fn execute(
        &self,
        session: &Session,
        request: &QueryRequest,
        node: Box<dyn PlanNode>,
    ) -> Result<QueryHandle> {
        let query_id = format!(
            "q-{}-{}",
            session.id,
            self.next_query.fetch_add(1, Ordering::Relaxed)
        );
        let ctx = ExecContext::new(query_id.clone(), self.pool.clone(), session.buffers.clone())
            .with_query_settings(&self.options.query)
            .with_retry(self.options.retry);

        let node: Box<dyn PlanNode> = match (self.cache.as_ref(), self.cache_id(session, request)) {
            (Some(cache), Some(id)) => Box::new(CachingNode::new(node, cache.clone(), id)),
            _ => node,
        };
        let mut plan = PlanExecutor::new(node);
        plan.open(ctx)?;

        self.active_queries.fetch_add(1, Ordering::Relaxed);
        let active = self.active_queries.clone();
        let start = Instant::now();
        let sql = request.sql.clone();
        let finished_id = query_id.clone();
        let handle = PlanDriver::new(plan)
            .with_options(DriverOptions::from(&self.options.query))
            .on_finish(move || {
                active.fetch_sub(1, Ordering::Relaxed);
                info!(
                    target: "queries",
                    query_id = %finished_id,
                    query = %sql,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Query finished"
                );
            })
            .spawn()?;
        info!(target: "queries", query_id = %query_id, session_id = session.id, "Query started");
        Ok(handle)
    }

    pub fn execute_and_collect(
        &self,
        session: &Session,
        request: &QueryRequest,
        node: Box<dyn PlanNode>,
    ) -> Result<Vec<TupleBatch>> {
        self.execute(session, request, node)?.collect()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_queries: self.active_queries(),
            pool: self.pool.stats(),
            cache: self.cache.as_ref().map(|c| c.stats()),
        }
    }

    /// Stop accepting queries and wait for running work to drain.
    pub fn shutdown(&self, timeout: Duration) -> Termination {
        self.pool.shutdown();
        let termination = self.pool.await_termination(timeout);
        info!(
            active_queries = self.active_queries(),
            termination = ?termination,
            "Execution engine shut down"
        );
        termination
    }

    fn cache_id(&self, session: &Session, request: &QueryRequest) -> Option<CacheId> {
        if !request.cacheable || self.cache.is_none() {
            return None;
        }
        let scope = match self.options.cache.scope {
            CacheScope::Connection => ScopeKey::Connection {
                session_id: session.id,
            },
            CacheScope::Schema => {
                let (vdb, version) = session.vdb.clone()?;
                ScopeKey::Schema { vdb, version }
            }
        };
        match CacheId::compute(&request.sql, &request.params, &scope) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(target: "cache", error = %e, "Could not fingerprint request, skipping cache");
                None
            }
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("pool", &self.pool)
            .field("cache", &self.cache)
            .field("active_queries", &self.active_queries())
            .finish()
    }
}
