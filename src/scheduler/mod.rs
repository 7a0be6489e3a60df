//! Scheduling
//!
//! Recurring runs on a local polling loop, plus partitioning of a run
//! across registered remote workers.

mod distributed;
mod local;
mod store;

pub use distributed::{
    ClusterStatus, DispatchReport, DistributedCoordinator, HttpWorkerTransport, WorkerStatus,
    WorkerTransport, LOCAL_WORKER,
};
pub use local::{RunTarget, ScheduleCoordinator, ScheduleState, SchedulerStatus};
pub use store::{ScheduleStore, WorkerStore};
