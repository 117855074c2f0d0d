use strata_error::{ErrorCode, Result, StrataError};

use crate::types::TupleBatch;

/// Checks that batches of one execution are contiguous, increasing and end
/// with exactly one terminal batch.
#[derive(Debug, Clone)]
pub struct BatchSequencer {
    next_row: u64,
    terminal_seen: bool,
    batches: u64,
}

impl Default for BatchSequencer {
    fn default() -> Self {
        Self {
            next_row: 1,
            terminal_seen: false,
            batches: 0,
        }
    }
}

impl BatchSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, batch: &TupleBatch) -> Result<()> {
        if self.terminal_seen {
            return Err(violation(format!(
                "Batch {}..={} produced after the terminal batch",
                batch.begin_row(),
                batch.end_row()
            )));
        }
        if batch.begin_row() != self.next_row {
            return Err(violation(format!(
                "Batch starts at row {} but row {} was expected",
                batch.begin_row(),
                self.next_row
            )));
        }
        self.next_row = batch.end_row() + 1;
        self.terminal_seen = batch.is_terminal();
        self.batches += 1;
        Ok(())
    }

    pub fn terminal_seen(&self) -> bool {
        self.terminal_seen
    }

    /// Rows delivered so far.
    pub fn rows(&self) -> u64 {
        self.next_row - 1
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }
}

fn violation(message: String) -> StrataError {
    StrataError::new(ErrorCode::PlanContractViolation, message)
        .with_hint("A plan node emitted batches out of order")
}
