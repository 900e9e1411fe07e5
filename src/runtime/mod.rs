pub mod service;
pub mod worker_pool;

pub use service::{RolloutService, ServiceError};
pub use worker_pool::{DispatchError, TaskJob, WorkerPool};
