//! Cycling workflow scheduling engine.
//!
//! A suite is a fixed set of [`task_def::TaskDefinition`]s, each recurring
//! over one or more [`sequence::Sequence`]s of [`cycle::CyclePoint`]s. The
//! [`scheduler::Scheduler`] main loop admits, submits, and retires
//! [`task_proxy::TaskProxy`] instances held in a [`task_pool::TaskPool`],
//! resolving [`prerequisite::Prerequisite`]s against upstream outputs and
//! [`broadcast::Broadcast`] runtime overrides, and dispatching job I/O
//! through a [`job_runner::JobRunner`].

pub mod broadcast;
pub mod commands;
pub mod config;
pub mod cycle;
pub mod error;
pub mod events;
pub mod job_runner;
pub mod logging;
pub mod prerequisite;
pub mod scheduler;
pub mod sequence;
pub mod store;
pub mod task_def;
pub mod task_pool;
pub mod task_proxy;
pub mod xtrigger;

pub use cycle::{Calendar, CyclePoint, Interval};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{Scheduler, SchedulerContext};
pub use task_proxy::{ProxyId, TaskProxy, TaskStatus};
