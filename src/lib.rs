pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod datastream;
pub mod diagnostics;
pub mod envelope;
pub mod partition;
pub mod pause;
pub mod producer;
pub mod source;
pub mod supervisor;
pub mod task;
pub mod trace;
pub mod tracker;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::{
    config::{ResetPolicy, SupervisorConfig, TaskConfig},
    datastream::{Datastream, DatastreamStatus},
    partition::SourcePartition,
    supervisor::TaskSupervisor,
    task::{TaskId, TaskState},
};
