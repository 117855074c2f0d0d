use std::sync::Arc;

use strata_error::Result;
use tracing::info;

use super::{CacheId, CacheResults, PartialResults, RequestToken, ResultCache};
use crate::exec::{BatchPoll, ExecContext, PlanExecutor, PlanNode};
use crate::types::{RowRange, SchemaRef};

enum Mode {
    Pending,
    Hit {
        results: Arc<CacheResults>,
        next_row: u64,
        finished: bool,
    },
    Fill {
        assembling: bool,
    },
}

/// Serves a cached result without opening the child, or runs the child and
/// records its batches in the cache.
pub struct CachingNode {
    child: PlanExecutor,
    cache: Arc<ResultCache>,
    id: CacheId,
    token: RequestToken,
    mode: Mode,
}

impl CachingNode {
    pub fn new(child: Box<dyn PlanNode>, cache: Arc<ResultCache>, id: CacheId) -> Self {
        let token = cache.new_request_token();
        Self {
            child: PlanExecutor::nested(child),
            cache,
            id,
            token,
            mode: Mode::Pending,
        }
    }

    pub fn cache_id(&self) -> &CacheId {
        &self.id
    }

    /// Whether the last open was answered from the cache.
    pub fn is_hit(&self) -> bool {
        matches!(self.mode, Mode::Hit { .. })
    }
}

impl PlanNode for CachingNode {
    fn name(&self) -> &str {
        "cache"
    }

    fn schema(&self) -> SchemaRef {
        self.child.schema()
    }

    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        let cached = self
            .cache
            .get_results(&self.id, RowRange::new(1, u64::MAX))
            .filter(|r| r.has_all_results() && r.first_row() == 1);
        if let Some(results) = cached {
            info!(
                target: "cache",
                query_id = %ctx.query_id(),
                cache_id = %self.id,
                rows = results.row_count(),
                "Serving query from cache"
            );
            self.mode = Mode::Hit {
                results,
                next_row: 1,
                finished: false,
            };
            return Ok(());
        }
        let assembling = self.cache.begin_assembly(&self.id, self.token);
        if !assembling {
            let reason = if self.cache.is_poisoned(&self.id) {
                "its result exceeds the cache size budget"
            } else {
                "another query is caching the same result"
            };
            ctx.warnings()
                .add(format!("Result cache bypassed for {}: {}", self.id, reason));
        }
        self.mode = Mode::Fill { assembling };
        self.child.open(ctx.clone())
    }

    fn poll_batch(&mut self, ctx: &ExecContext) -> Result<BatchPoll> {
        match &mut self.mode {
            Mode::Pending => Ok(BatchPoll::Done),
            Mode::Hit {
                results,
                next_row,
                finished,
            } => {
                if *finished {
                    return Ok(BatchPoll::Done);
                }
                let end = *next_row + ctx.batch_rows() as u64 - 1;
                let batch = results.batch(RowRange::new(*next_row, end));
                *next_row = batch.end_row() + 1;
                *finished = batch.is_terminal();
                Ok(BatchPoll::Ready(batch))
            }
            Mode::Fill { assembling } => {
                let polled = self.child.next_batch()?;
                if let BatchPoll::Ready(batch) = &polled {
                    if *assembling {
                        let partial = PartialResults::from_batch(self.child.schema(), batch);
                        let accepted = self.cache.set_results(&self.id, partial, self.token);
                        if !accepted {
                            ctx.warnings().add(not_cached(&self.cache, &self.id));
                        }
                        *assembling = accepted && !batch.is_terminal();
                    }
                }
                Ok(polled)
            }
        }
    }

    fn close(&mut self, _ctx: &ExecContext) {
        self.child.close();
        if let Mode::Fill { assembling: true } = self.mode {
            self.cache.abort_assembly(&self.id, self.token);
        }
    }
}

fn not_cached(cache: &ResultCache, id: &CacheId) -> String {
    if cache.is_poisoned(id) {
        format!("Result for {} not cached: it exceeds the cache size budget", id)
    } else {
        format!("Result for {} not cached: the cache refused it", id)
    }
}
