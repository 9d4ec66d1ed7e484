pub mod config;
pub mod dispatch;
pub mod executor;
pub mod humanize;
pub mod job;
pub mod observability;
pub mod pool;
pub mod worker;

pub use dispatch::{Dispatcher, QueueDispatcher};
pub use job::{Job, JobConfig, JobResult};
pub use pool::{Pool, PoolError, finalize_channel};
