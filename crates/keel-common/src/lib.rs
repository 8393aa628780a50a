//! Common types for Keel: work items, errors, conditions and handler pipelines

#![deny(missing_docs)]

pub mod condition;
pub mod context;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod status;
pub mod telemetry;
pub mod work_item;

pub use condition::{Condition, ConditionList, CONDITION_READY};
pub use context::ReconcileContext;
pub use error::{Error, ErrorKind};
pub use pipeline::{Outcome, Pipeline, Step, StepCondition};
pub use work_item::{Operation, WorkItem};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
