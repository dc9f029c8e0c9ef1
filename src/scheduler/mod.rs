//! Request scheduling for the dispatch control plane.
//!
//! Placement strategies, the bounded pending queue, the decision log and
//! the dispatcher that ties them to the runner registry.

mod decision;
mod dispatcher;
mod queue;
mod request;
mod strategy;
mod sweeper;

pub use decision::{DecisionLog, DecisionOutcome, DecisionOverflow, SchedulingDecision};
pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherSnapshot, FailureWatch, Placement, RequestGuard,
    RunnerSnapshot, Submission, SweepReport,
};
pub use queue::{PendingQueue, PendingQueueConfig, QueueError};
pub use request::{InferenceRequest, RequestFilter, RequestStatus};
pub use strategy::{BinPack, MaxSpread, PlacementStrategy, SchedulingStrategy};
pub use sweeper::spawn_sweeper;
