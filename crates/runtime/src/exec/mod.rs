//! Plan execution: the batch protocol, its contract checks and the nodes
//! and drivers built on top of it.

mod cancel;
mod context;
mod driver;
mod plan;
mod sequencer;
mod source;
mod spool;
mod values;

pub use cancel::CancellationToken;
pub use context::ExecContext;
pub use driver::{collect_batches, DriverOptions, PlanDriver, QueryHandle};
pub use plan::{BatchPoll, PlanExecutor, PlanNode, PlanOutcome, PlanState};
pub use sequencer::BatchSequencer;
pub use source::{FetchRequest, FetchResponse, RowSource, SourceFetchNode};
pub use spool::{SpoolMode, SpoolNode};
pub use values::ValuesNode;
