//! Results collection and storage
//!
//! Workers record outcomes into a shared collector; one flush at the end of
//! a run hands the batch to a persistence sink such as [`ResultsStorage`].

mod collector;
mod storage;

pub use collector::{MemorySink, ResultCollector, ResultSink};
pub use storage::{
    generate_run_id, EnvironmentInfo, ExportFormat, ResultsStorage, RunInfo, RunSink, StoredRun,
};
