//! On-disk segment files.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_error::{ErrorCode, ErrorContext, Result, StrataError};
use tempfile::TempDir;
use tracing::warn;

use crate::types::Row;

/// Create the per-manager spill directory under `parent`, or under the OS
/// temp dir when no parent is configured.
pub(crate) fn create_spill_dir(parent: Option<&Path>) -> std::io::Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("strata-spill-");
    match parent {
        Some(dir) => builder.tempdir_in(dir),
        None => builder.tempdir(),
    }
}

/// One spilled segment. The file is deleted when the last handle drops.
#[derive(Debug)]
pub(crate) struct SpillFile {
    path: PathBuf,
    bytes: u64,
    // Keeps the directory alive while any segment still references it.
    _dir: Arc<TempDir>,
}

impl SpillFile {
    pub(crate) fn write(dir: &Arc<TempDir>, name: &str, rows: &[Row]) -> std::io::Result<Self> {
        let path = dir.path().join(name);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, rows).map_err(bincode_to_io)?;
        writer.flush()?;
        let bytes = writer.get_ref().metadata()?.len();
        Ok(Self {
            path,
            bytes,
            _dir: dir.clone(),
        })
    }

    pub(crate) fn read(&self) -> std::io::Result<Vec<Row>> {
        let file = File::open(&self.path)?;
        bincode::deserialize_from(BufReader::new(file)).map_err(bincode_to_io)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    target: "buffer",
                    path = ?self.path,
                    error = %e,
                    "Failed to delete spill file"
                );
            }
        }
    }
}

fn bincode_to_io(err: bincode::Error) -> std::io::Error {
    match *err {
        bincode::ErrorKind::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
    }
}

pub(crate) fn spill_error(
    buffer_id: impl ToString,
    path: Option<&Path>,
    segment_rows: usize,
    err: std::io::Error,
) -> StrataError {
    StrataError::new(ErrorCode::SpillFailed, format!("Spill I/O failed: {}", err))
        .with_context(ErrorContext::Spill {
            buffer_id: buffer_id.to_string(),
            path: path.map(|p| p.display().to_string()),
            segment_rows,
        })
        .with_hint("Check free space and permissions of buffer.disk_spill_directory")
}

pub(crate) fn read_segment(file: &SpillFile, buffer_id: impl ToString) -> Result<Vec<Row>> {
    file.read()
        .map_err(|e| spill_error(buffer_id, Some(file.path()), 0, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_file_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let dir = Arc::new(create_spill_dir(Some(parent.path())).unwrap());
        let rows = vec![vec![Value::Int64(7), Value::from("seven")]];

        let file = SpillFile::write(&dir, "seg-1.bin", &rows).unwrap();
        let path = file.path().to_path_buf();
        assert!(path.exists());
        assert!(file.bytes() > 0);
        assert_eq!(file.read().unwrap(), rows);

        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_dir_outlives_manager_handle() {
        let parent = tempfile::tempdir().unwrap();
        let dir = Arc::new(create_spill_dir(Some(parent.path())).unwrap());
        let dir_path = dir.path().to_path_buf();
        let file = SpillFile::write(&dir, "seg-2.bin", &[]).unwrap();

        drop(dir);
        assert!(dir_path.exists());
        drop(file);
        assert!(!dir_path.exists());
    }
}
