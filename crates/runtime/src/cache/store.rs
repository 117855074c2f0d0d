use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_error::{ErrorCode, Result, StrataError};
use tracing::debug;

use super::id::CacheId;
use super::results::CacheResults;
use crate::buffer::{BufferId, BufferManager};
use crate::types::RowRange;

/// Durable side of the result cache. Only complete results are stored.
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn get(&self, id: &CacheId) -> Result<Option<Arc<CacheResults>>>;

    fn put(&self, id: CacheId, results: Arc<CacheResults>) -> Result<()>;

    fn remove(&self, id: &CacheId) -> Result<bool>;

    fn contains(&self, id: &CacheId) -> bool;

    fn clear(&self) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CacheId, Arc<CacheResults>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, id: &CacheId) -> Result<Option<Arc<CacheResults>>> {
        Ok(self.entries.lock().get(id).cloned())
    }

    fn put(&self, id: CacheId, results: Arc<CacheResults>) -> Result<()> {
        self.entries.lock().insert(id, results);
        Ok(())
    }

    fn remove(&self, id: &CacheId) -> Result<bool> {
        Ok(self.entries.lock().remove(id).is_some())
    }

    fn contains(&self, id: &CacheId) -> bool {
        self.entries.lock().contains_key(id)
    }

    fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredBuffer {
    buffer: BufferId,
    size_bytes: usize,
}

/// Keeps cached rows in tuple buffers so large results spill to disk with
/// the rest of the buffer manager's data.
pub struct BufferBackedStore {
    buffers: Arc<BufferManager>,
    entries: Mutex<HashMap<CacheId, StoredBuffer>>,
}

impl BufferBackedStore {
    pub fn new(buffers: Arc<BufferManager>) -> Self {
        Self {
            buffers,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn store_error(id: &CacheId, err: StrataError) -> StrataError {
        StrataError::new(
            ErrorCode::CacheStoreFailed,
            format!("Buffer-backed cache entry {} failed: {}", id, err.message),
        )
    }
}

impl CacheStore for BufferBackedStore {
    fn name(&self) -> &'static str {
        "buffer"
    }

    fn get(&self, id: &CacheId) -> Result<Option<Arc<CacheResults>>> {
        let Some(stored) = self.entries.lock().get(id).copied() else {
            return Ok(None);
        };
        let read = || -> Result<CacheResults> {
            let schema = self.buffers.schema(stored.buffer)?;
            let rows = self.buffers.row_count(stored.buffer)?;
            let batch = self.buffers.get_batch(stored.buffer, RowRange::new(1, rows))?;
            Ok(CacheResults::from_rows(schema, batch.to_rows(), stored.size_bytes))
        };
        read()
            .map(|results| Some(Arc::new(results)))
            .map_err(|e| Self::store_error(id, e))
    }

    fn put(&self, id: CacheId, results: Arc<CacheResults>) -> Result<()> {
        let buffer = self.buffers.create_buffer(results.schema());
        let written = self
            .buffers
            .add_rows(buffer, results.rows_in(results.range()))
            .and_then(|_| self.buffers.mark_complete(buffer));
        if let Err(e) = written {
            self.buffers.release_buffer(buffer);
            return Err(Self::store_error(&id, e));
        }
        debug!(target: "cache", cache_id = %id, buffer_id = %buffer, "Stored cache entry in buffer");
        let previous = self.entries.lock().insert(
            id,
            StoredBuffer {
                buffer,
                size_bytes: results.size_bytes(),
            },
        );
        if let Some(previous) = previous {
            self.buffers.release_buffer(previous.buffer);
        }
        Ok(())
    }

    fn remove(&self, id: &CacheId) -> Result<bool> {
        let removed = self.entries.lock().remove(id);
        Ok(match removed {
            Some(stored) => {
                self.buffers.release_buffer(stored.buffer);
                true
            }
            None => false,
        })
    }

    fn contains(&self, id: &CacheId) -> bool {
        self.entries.lock().contains_key(id)
    }

    fn clear(&self) -> Result<()> {
        let drained: Vec<StoredBuffer> = self.entries.lock().drain().map(|(_, s)| s).collect();
        for stored in drained {
            self.buffers.release_buffer(stored.buffer);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
