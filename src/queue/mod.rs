//! Job queue - admission control, priority scheduling and the worker pool

pub mod admission;
pub mod scheduler;
pub mod worker;

pub use admission::{AdmissionController, AdmissionDecision};
pub use scheduler::{
    AbandonedJob, CancelOutcome, ClaimedJob, FailureDisposition, JobHandle, JobSnapshot, PriorityScheduler,
    QueueMetricsSnapshot,
};
pub use worker::{JobProcessor, WorkerPool};
