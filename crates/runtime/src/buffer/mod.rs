//! Tiered tuple buffers.
//!
//! A [`BufferManager`] owns every intermediate row of a session. Rows are
//! appended into fixed-size segments; when resident bytes exceed the
//! configured cap, sealed segments of the least recently accessed buffer are
//! written to a private spill directory and read back on demand. Callers only
//! ever hold a [`BufferId`].
//!
//! # Example
//!
//! ```rust
//! use strata_runtime::buffer::{BufferManager, BufferManagerOptions};
//! use strata_runtime::types::{ColumnDescriptor, DataType, RowRange, RowSchema, Value};
//!
//! let manager = BufferManager::new(BufferManagerOptions::default());
//! let schema = RowSchema::new(vec![ColumnDescriptor::new("id", DataType::Int64, false)]);
//! let id = manager.create_buffer(schema.into_ref());
//! manager.add_rows(id, vec![vec![Value::Int64(1)], vec![Value::Int64(2)]]).unwrap();
//! manager.mark_complete(id).unwrap();
//! let batch = manager.get_batch(id, RowRange::new(1, 2)).unwrap();
//! assert!(batch.is_terminal());
//! ```

mod segment;
mod spill;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_common::config::BufferSettings;
use strata_error::{ErrorCode, ErrorContext, Result, StrataError};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::types::{Row, RowRange, SchemaRef, TupleBatch};
use segment::{Segment, SegmentData};
use spill::{create_spill_dir, read_segment, spill_error, SpillFile};

/// Opaque handle to a tuple buffer, unique within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BufferManagerOptions {
    pub memory_cap_bytes: usize,
    pub spill_directory: Option<PathBuf>,
    pub segment_rows: usize,
    pub working_set_segments: usize,
}

impl Default for BufferManagerOptions {
    fn default() -> Self {
        Self::from(&BufferSettings::default())
    }
}

impl From<&BufferSettings> for BufferManagerOptions {
    fn from(settings: &BufferSettings) -> Self {
        Self {
            memory_cap_bytes: settings.memory_cap_bytes,
            spill_directory: settings.disk_spill_directory.as_ref().map(PathBuf::from),
            segment_rows: settings.segment_rows.max(1),
            working_set_segments: settings.working_set_segments,
        }
    }
}

/// Point-in-time counters of a manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub buffers: usize,
    pub resident_bytes: usize,
    /// Peak of `resident_bytes` over the manager's lifetime.
    pub high_water_bytes: usize,
    /// Times the cap was exceeded with no segment left to spill.
    pub cap_overruns: u64,
    pub spilled_segments: usize,
    pub spilled_bytes: u64,
    pub spill_writes: u64,
    pub spill_reads: u64,
}

struct TupleBuffer {
    schema: SchemaRef,
    segments: Vec<Segment>,
    row_count: u64,
    complete: bool,
    last_access: u64,
}

#[derive(Default)]
struct ManagerState {
    buffers: HashMap<BufferId, TupleBuffer>,
    next_id: u64,
    clock: u64,
    resident_bytes: usize,
    high_water_bytes: usize,
    over_cap: bool,
    cap_overruns: u64,
    spill_writes: u64,
    spill_dir: Option<Arc<TempDir>>,
}

impl ManagerState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Oldest spillable segment of the least recently accessed buffer.
    fn pick_victim(&self, working_set: usize) -> Option<(BufferId, usize)> {
        let mut candidates: Vec<(&BufferId, &TupleBuffer)> = self.buffers.iter().collect();
        candidates.sort_by_key(|(_, buffer)| buffer.last_access);
        candidates.into_iter().find_map(|(id, buffer)| {
            let window = buffer.segments.len().saturating_sub(working_set);
            buffer.segments[..window]
                .iter()
                .position(Segment::is_spillable)
                .map(|idx| (*id, idx))
        })
    }
}

/// Owner of all tuple buffers of one session.
pub struct BufferManager {
    options: BufferManagerOptions,
    state: Mutex<ManagerState>,
    spill_reads: AtomicU64,
}

impl BufferManager {
    pub fn new(options: BufferManagerOptions) -> Self {
        Self {
            options,
            state: Mutex::new(ManagerState::default()),
            spill_reads: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &BufferManagerOptions {
        &self.options
    }

    pub fn create_buffer(&self, schema: SchemaRef) -> BufferId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = BufferId(state.next_id);
        let last_access = state.tick();
        state.buffers.insert(
            id,
            TupleBuffer {
                schema,
                segments: Vec::new(),
                row_count: 0,
                complete: false,
                last_access,
            },
        );
        debug!(target: "buffer", buffer_id = %id, "Created tuple buffer");
        id
    }

    /// Append rows; returns the row number of the last row now stored.
    pub fn add_rows(&self, id: BufferId, rows: Vec<Row>) -> Result<u64> {
        let segment_rows = self.options.segment_rows;
        let mut state = self.state.lock();
        let tick = state.tick();
        let buffer = state.buffers.get_mut(&id).ok_or_else(|| not_found(id))?;

        if buffer.complete {
            return Err(StrataError::new(
                ErrorCode::InvalidRow,
                format!("Buffer {} is complete and no longer accepts rows", id),
            ));
        }
        let arity = buffer.schema.arity();
        if let Some(bad) = rows.iter().find(|row| row.len() != arity) {
            return Err(StrataError::new(
                ErrorCode::InvalidRow,
                format!("Row has {} values, buffer {} expects {}", bad.len(), id, arity),
            )
            .with_context(ErrorContext::RowArity {
                buffer_id: id.to_string(),
                expected: arity,
                actual: bad.len(),
            }));
        }

        buffer.last_access = tick;
        let mut added = 0;
        for row in rows {
            let needs_segment = buffer.segments.last().map_or(true, |s| !s.is_open());
            if needs_segment {
                buffer.segments.push(Segment::open());
            }
            if let Some(tail) = buffer.segments.last_mut() {
                added += tail.push(row);
                if tail.rows >= segment_rows {
                    tail.seal();
                }
            }
            buffer.row_count += 1;
        }
        let last_row = buffer.row_count;

        state.resident_bytes += added;
        state.high_water_bytes = state.high_water_bytes.max(state.resident_bytes);
        self.spill_until_under_cap(&mut state)?;
        Ok(last_row)
    }

    /// Seal the buffer; reads that reach its last row become terminal.
    pub fn mark_complete(&self, id: BufferId) -> Result<u64> {
        let mut state = self.state.lock();
        let buffer = state.buffers.get_mut(&id).ok_or_else(|| not_found(id))?;
        buffer.complete = true;
        if let Some(tail) = buffer.segments.last_mut() {
            tail.seal();
        }
        Ok(buffer.row_count)
    }

    pub fn row_count(&self, id: BufferId) -> Result<u64> {
        let state = self.state.lock();
        state
            .buffers
            .get(&id)
            .map(|b| b.row_count)
            .ok_or_else(|| not_found(id))
    }

    pub fn is_complete(&self, id: BufferId) -> Result<bool> {
        let state = self.state.lock();
        state
            .buffers
            .get(&id)
            .map(|b| b.complete)
            .ok_or_else(|| not_found(id))
    }

    pub fn schema(&self, id: BufferId) -> Result<SchemaRef> {
        let state = self.state.lock();
        state
            .buffers
            .get(&id)
            .map(|b| b.schema.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Read an inclusive row range, loading spilled segments as needed.
    ///
    /// An empty range directly after the last row (`row_count + 1 ..=
    /// row_count`) is accepted and yields an empty batch.
    pub fn get_batch(&self, id: BufferId, range: RowRange) -> Result<TupleBatch> {
        let segment_rows = self.options.segment_rows as u64;
        let mut guard = PinGuard {
            manager: self,
            id,
            segments: Vec::new(),
        };

        let (parts, terminal) = {
            let mut state = self.state.lock();
            let tick = state.tick();
            let buffer = state.buffers.get_mut(&id).ok_or_else(|| not_found(id))?;
            buffer.last_access = tick;

            let valid = range.begin >= 1
                && range.end <= buffer.row_count
                && range.begin <= range.end.saturating_add(1);
            if !valid {
                return Err(StrataError::new(
                    ErrorCode::RowRangeOutOfBounds,
                    format!(
                        "Rows {}..={} requested from {} which holds {} rows",
                        range.begin, range.end, id, buffer.row_count
                    ),
                )
                .with_context(ErrorContext::RowRange {
                    buffer_id: id.to_string(),
                    begin_row: range.begin,
                    end_row: range.end,
                    row_count: buffer.row_count,
                }));
            }
            let terminal = buffer.complete && range.end == buffer.row_count;
            if range.is_empty() {
                return Ok(TupleBatch::new(Vec::new(), range.begin, terminal));
            }

            let first_seg = ((range.begin - 1) / segment_rows) as usize;
            let last_seg = ((range.end - 1) / segment_rows) as usize;
            let mut parts = Vec::with_capacity(last_seg - first_seg + 1);
            for idx in first_seg..=last_seg {
                let seg_begin = idx as u64 * segment_rows + 1;
                let lo = (range.begin.max(seg_begin) - seg_begin) as usize;
                let hi = (range.end.min(seg_begin + segment_rows - 1) - seg_begin) as usize + 1;
                let segment = &mut buffer.segments[idx];
                let part = match &segment.data {
                    SegmentData::Open(rows) => Part::Copied(rows[lo..hi].to_vec()),
                    SegmentData::Memory(rows) => Part::Shared(rows.clone(), lo, hi),
                    SegmentData::Disk(file) => Part::Spilled(file.clone(), lo, hi),
                };
                if !matches!(part, Part::Copied(_)) {
                    segment.pins += 1;
                    guard.segments.push(idx);
                }
                parts.push(part);
            }
            (parts, terminal)
        };

        let mut rows = Vec::with_capacity(range.len() as usize);
        for part in parts {
            match part {
                Part::Copied(copied) => rows.extend(copied),
                Part::Shared(seg, lo, hi) => rows.extend_from_slice(&seg[lo..hi]),
                Part::Spilled(file, lo, hi) => {
                    let seg = read_segment(&file, id)?;
                    self.spill_reads.fetch_add(1, Ordering::Relaxed);
                    let hi = hi.min(seg.len());
                    rows.extend_from_slice(&seg[lo.min(hi)..hi]);
                }
            }
        }
        drop(guard);
        Ok(TupleBatch::new(rows, range.begin, terminal))
    }

    /// Free a buffer and its spill files. Returns whether it existed.
    pub fn release_buffer(&self, id: BufferId) -> bool {
        let mut state = self.state.lock();
        match state.buffers.remove(&id) {
            Some(buffer) => {
                let resident: usize = buffer
                    .segments
                    .iter()
                    .filter(|s| s.is_resident())
                    .map(|s| s.bytes)
                    .sum();
                state.resident_bytes = state.resident_bytes.saturating_sub(resident);
                if state.resident_bytes <= self.options.memory_cap_bytes {
                    state.over_cap = false;
                }
                debug!(
                    target: "buffer",
                    buffer_id = %id,
                    rows = buffer.row_count,
                    "Released tuple buffer"
                );
                true
            }
            None => false,
        }
    }

    /// Whether resident rows exceed the memory cap with nothing spillable.
    pub fn is_over_cap(&self) -> bool {
        let state = self.state.lock();
        state.over_cap && state.resident_bytes > self.options.memory_cap_bytes
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        let mut stats = BufferStats {
            buffers: state.buffers.len(),
            resident_bytes: state.resident_bytes,
            high_water_bytes: state.high_water_bytes,
            cap_overruns: state.cap_overruns,
            spill_writes: state.spill_writes,
            spill_reads: self.spill_reads.load(Ordering::Relaxed),
            ..Default::default()
        };
        for segment in state.buffers.values().flat_map(|b| b.segments.iter()) {
            if let SegmentData::Disk(file) = &segment.data {
                stats.spilled_segments += 1;
                stats.spilled_bytes += file.bytes();
            }
        }
        stats
    }

    // TODO: spill writes happen under the state lock; move the file write
    // out once segments carry a "spilling" state readers can wait on.
    fn spill_until_under_cap(&self, state: &mut ManagerState) -> Result<()> {
        while state.resident_bytes > self.options.memory_cap_bytes {
            let Some((id, idx)) = state.pick_victim(self.options.working_set_segments) else {
                if !state.over_cap {
                    state.over_cap = true;
                    state.cap_overruns += 1;
                    warn!(
                        target: "buffer",
                        resident_bytes = state.resident_bytes,
                        memory_cap_bytes = self.options.memory_cap_bytes,
                        "Memory cap exceeded with no spillable segment"
                    );
                }
                return Ok(());
            };
            self.spill_segment(state, id, idx)?;
        }
        state.over_cap = false;
        Ok(())
    }

    fn spill_segment(&self, state: &mut ManagerState, id: BufferId, idx: usize) -> Result<()> {
        let dir = match &state.spill_dir {
            Some(dir) => dir.clone(),
            None => {
                let dir = create_spill_dir(self.options.spill_directory.as_deref())
                    .map(Arc::new)
                    .map_err(|e| {
                        spill_error(id, self.options.spill_directory.as_deref(), 0, e)
                    })?;
                debug!(target: "buffer", path = ?dir.path(), "Created spill directory");
                state.spill_dir = Some(dir.clone());
                dir
            }
        };

        let buffer = state.buffers.get_mut(&id).ok_or_else(|| not_found(id))?;
        let segment = &mut buffer.segments[idx];
        let SegmentData::Memory(rows) = &segment.data else {
            return Ok(());
        };
        let name = format!("seg-{:06}-{:06}.bin", id.0, idx);
        let file = SpillFile::write(&dir, &name, rows)
            .map_err(|e| spill_error(id, Some(dir.path().join(&name).as_path()), segment.rows, e))?;

        debug!(
            target: "buffer",
            buffer_id = %id,
            segment = idx,
            rows = segment.rows,
            file_bytes = file.bytes(),
            "Spilled segment to disk"
        );
        segment.data = SegmentData::Disk(Arc::new(file));
        let freed = segment.bytes;
        state.resident_bytes = state.resident_bytes.saturating_sub(freed);
        state.spill_writes += 1;
        Ok(())
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.buffers.is_empty() {
            debug!(
                target: "buffer",
                buffers = state.buffers.len(),
                "Reclaiming unreleased buffers"
            );
        }
        state.buffers.clear();
        state.spill_dir = None;
    }
}

enum Part {
    Copied(Vec<Row>),
    Shared(Arc<Vec<Row>>, usize, usize),
    Spilled(Arc<SpillFile>, usize, usize),
}

/// Keeps segments read by an in-progress `get_batch` out of the spiller.
struct PinGuard<'a> {
    manager: &'a BufferManager,
    id: BufferId,
    segments: Vec<usize>,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        if self.segments.is_empty() {
            return;
        }
        let mut state = self.manager.state.lock();
        if let Some(buffer) = state.buffers.get_mut(&self.id) {
            for &idx in &self.segments {
                if let Some(segment) = buffer.segments.get_mut(idx) {
                    segment.pins = segment.pins.saturating_sub(1);
                }
            }
        }
    }
}

fn not_found(id: BufferId) -> StrataError {
    StrataError::new(ErrorCode::BufferNotFound, format!("Buffer {} not found", id))
        .with_context(ErrorContext::Buffer {
            buffer_id: id.to_string(),
        })
        .with_hint("The buffer was released or belongs to another session")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnDescriptor, DataType, RowSchema, Value};

    fn schema() -> SchemaRef {
        RowSchema::new(vec![
            ColumnDescriptor::new("id", DataType::Int64, false),
            ColumnDescriptor::new("name", DataType::Utf8, true),
        ])
        .into_ref()
    }

    fn rows(from: i64, to: i64) -> Vec<Row> {
        (from..=to)
            .map(|i| vec![Value::Int64(i), Value::from(format!("row-{}", i))])
            .collect()
    }

    fn small_manager(dir: &std::path::Path, cap: usize) -> BufferManager {
        BufferManager::new(BufferManagerOptions {
            memory_cap_bytes: cap,
            spill_directory: Some(dir.to_path_buf()),
            segment_rows: 10,
            working_set_segments: 1,
        })
    }

    #[test]
    fn test_read_your_writes() {
        let manager = BufferManager::new(BufferManagerOptions::default());
        let id = manager.create_buffer(schema());
        assert_eq!(manager.add_rows(id, rows(1, 5)).unwrap(), 5);
        assert_eq!(manager.add_rows(id, rows(6, 7)).unwrap(), 7);

        let batch = manager.get_batch(id, RowRange::new(3, 6)).unwrap();
        assert_eq!(batch.to_rows(), rows(3, 6));
        assert!(!batch.is_terminal());
    }

    #[test]
    fn test_terminal_only_after_complete() {
        let manager = BufferManager::new(BufferManagerOptions::default());
        let id = manager.create_buffer(schema());
        manager.add_rows(id, rows(1, 3)).unwrap();
        assert!(!manager.get_batch(id, RowRange::new(1, 3)).unwrap().is_terminal());

        manager.mark_complete(id).unwrap();
        assert!(manager.get_batch(id, RowRange::new(2, 3)).unwrap().is_terminal());
        assert!(!manager.get_batch(id, RowRange::new(1, 2)).unwrap().is_terminal());
        assert!(manager.add_rows(id, rows(4, 4)).is_err());
    }

    #[test]
    fn test_wrong_arity_rejected() {
        let manager = BufferManager::new(BufferManagerOptions::default());
        let id = manager.create_buffer(schema());
        let err = manager.add_rows(id, vec![vec![Value::Int64(1)]]).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRow);
        assert_eq!(manager.row_count(id).unwrap(), 0);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let manager = BufferManager::new(BufferManagerOptions::default());
        let id = manager.create_buffer(schema());
        manager.add_rows(id, rows(1, 4)).unwrap();

        for range in [RowRange::new(0, 2), RowRange::new(3, 5), RowRange::new(6, 4)] {
            let err = manager.get_batch(id, range).unwrap_err();
            assert_eq!(err.code, ErrorCode::RowRangeOutOfBounds);
        }
        assert!(manager.get_batch(id, RowRange::new(5, 4)).unwrap().is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let manager = BufferManager::new(BufferManagerOptions::default());
        let id = manager.create_buffer(schema());
        manager.add_rows(id, rows(1, 2)).unwrap();
        assert!(manager.release_buffer(id));
        assert!(!manager.release_buffer(id));
        assert_eq!(
            manager.get_batch(id, RowRange::new(1, 1)).unwrap_err().code,
            ErrorCode::BufferNotFound
        );
        assert_eq!(manager.stats().resident_bytes, 0);
    }

    #[test]
    fn test_spills_over_cap_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let manager = small_manager(dir.path(), 1024);
        let id = manager.create_buffer(schema());
        manager.add_rows(id, rows(1, 100)).unwrap();

        let stats = manager.stats();
        assert!(stats.spill_writes > 0);
        assert!(stats.high_water_bytes >= stats.resident_bytes);

        let batch = manager.get_batch(id, RowRange::new(1, 100)).unwrap();
        assert_eq!(batch.to_rows(), rows(1, 100));
        assert!(manager.stats().spill_reads > 0);
    }

    #[test]
    fn test_working_set_never_spilled() {
        let dir = tempfile::tempdir().unwrap();
        let manager = small_manager(dir.path(), 0);
        let id = manager.create_buffer(schema());
        manager.add_rows(id, rows(1, 20)).unwrap();

        let state = manager.state.lock();
        let buffer = &state.buffers[&id];
        assert!(matches!(buffer.segments[0].data, SegmentData::Disk(_)));
        assert!(matches!(buffer.segments[1].data, SegmentData::Memory(_)));
    }

    #[test]
    fn test_pinned_segment_not_spilled() {
        let dir = tempfile::tempdir().unwrap();
        let manager = small_manager(dir.path(), usize::MAX);
        let id = manager.create_buffer(schema());
        manager.add_rows(id, rows(1, 30)).unwrap();

        {
            let mut state = manager.state.lock();
            state.buffers.get_mut(&id).unwrap().segments[0].pins = 1;
            assert_eq!(state.pick_victim(1), Some((id, 1)));
        }
    }

    #[test]
    fn test_lru_buffer_spills_first() {
        let dir = tempfile::tempdir().unwrap();
        let manager = small_manager(dir.path(), usize::MAX);
        let cold = manager.create_buffer(schema());
        let hot = manager.create_buffer(schema());
        manager.add_rows(cold, rows(1, 30)).unwrap();
        manager.add_rows(hot, rows(1, 30)).unwrap();
        manager.get_batch(hot, RowRange::new(1, 1)).unwrap();

        let state = manager.state.lock();
        assert_eq!(state.pick_victim(1), Some((cold, 0)));
    }

    #[test]
    fn test_high_water_tracks_peak_and_overruns() {
        let dir = tempfile::tempdir().unwrap();
        let manager = small_manager(dir.path(), 2048);
        let id = manager.create_buffer(schema());
        manager.add_rows(id, rows(1, 100)).unwrap();

        // Spilling brought residency back down, the peak stays recorded
        let stats = manager.stats();
        assert!(stats.resident_bytes <= 2048);
        assert!(stats.high_water_bytes > 2048);
        assert!(stats.high_water_bytes >= stats.resident_bytes);
        assert_eq!(stats.cap_overruns, 0);
        assert!(!manager.is_over_cap());

        let pinned = BufferManager::new(BufferManagerOptions {
            memory_cap_bytes: 0,
            spill_directory: Some(dir.path().to_path_buf()),
            segment_rows: 10,
            working_set_segments: 100,
        });
        let id = pinned.create_buffer(schema());
        pinned.add_rows(id, rows(1, 5)).unwrap();
        pinned.add_rows(id, rows(6, 10)).unwrap();
        assert!(pinned.is_over_cap());
        assert_eq!(pinned.stats().cap_overruns, 1);
        assert_eq!(pinned.stats().spill_writes, 0);

        pinned.release_buffer(id);
        assert!(!pinned.is_over_cap());
    }

    #[test]
    fn test_spill_failure_reported() {
        let not_a_dir = tempfile::NamedTempFile::new().unwrap();
        let manager = small_manager(not_a_dir.path(), 0);
        let id = manager.create_buffer(schema());
        let err = manager.add_rows(id, rows(1, 25)).unwrap_err();
        assert_eq!(err.code, ErrorCode::SpillFailed);
        assert!(matches!(err.context, Some(ErrorContext::Spill { .. })));
    }

    #[test]
    fn test_drop_removes_spill_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = small_manager(dir.path(), 0);
        let id = manager.create_buffer(schema());
        manager.add_rows(id, rows(1, 50)).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        drop(manager);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
