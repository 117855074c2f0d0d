use std::sync::Arc;

use super::spill::SpillFile;
use crate::types::{row_size, Row};

/// Storage of one fixed-size run of rows.
#[derive(Debug)]
pub(crate) enum SegmentData {
    /// Tail segment still accepting rows.
    Open(Vec<Row>),
    /// Full segment held in memory.
    Memory(Arc<Vec<Row>>),
    /// Full segment written to a spill file.
    Disk(Arc<SpillFile>),
}

#[derive(Debug)]
pub(crate) struct Segment {
    pub(crate) data: SegmentData,
    pub(crate) rows: usize,
    /// Approximate in-memory size; kept after spilling for reload accounting.
    pub(crate) bytes: usize,
    /// Readers currently copying out of this segment.
    pub(crate) pins: usize,
}

impl Segment {
    pub(crate) fn open() -> Self {
        Self {
            data: SegmentData::Open(Vec::new()),
            rows: 0,
            bytes: 0,
            pins: 0,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.data, SegmentData::Open(_))
    }

    pub(crate) fn is_resident(&self) -> bool {
        !matches!(self.data, SegmentData::Disk(_))
    }

    /// Sealed, in memory and not pinned by a reader.
    pub(crate) fn is_spillable(&self) -> bool {
        self.pins == 0 && matches!(self.data, SegmentData::Memory(_))
    }

    /// Append one row; returns the bytes it added.
    pub(crate) fn push(&mut self, row: Row) -> usize {
        let size = row_size(&row);
        if let SegmentData::Open(rows) = &mut self.data {
            rows.push(row);
            self.rows += 1;
            self.bytes += size;
        }
        size
    }

    pub(crate) fn seal(&mut self) {
        if let SegmentData::Open(rows) = &mut self.data {
            let rows = std::mem::take(rows);
            self.data = SegmentData::Memory(Arc::new(rows));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_seal_makes_segment_spillable() {
        let mut segment = Segment::open();
        let added = segment.push(vec![Value::Int64(1)]);
        assert!(added > 0);
        assert!(segment.is_open());
        assert!(!segment.is_spillable());

        segment.seal();
        assert!(!segment.is_open());
        assert!(segment.is_resident());
        assert!(segment.is_spillable());

        segment.pins += 1;
        assert!(!segment.is_spillable());
    }
}
