use crate::clients::{EtcdKeyStore, FsObjectStore, KeyStore, ObjectStore, RemoteExecutor, SshExecutor};
use crate::config::{ConfigError, Settings};
use crate::ledger::{LedgerError, SqliteTaskLedger, TaskFilter, TaskLedger, TaskRecord};
use crate::rollout::{GuardError, Operation, TaskOutcome, WorkflowEngine};
use crate::runtime::worker_pool::{DispatchError, TaskJob, WorkerPool};
use crate::shared::ids::generate_task_id;
use crate::shared::{now_secs, EventLog};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("task id generation failed: {0}")]
    TaskId(String),
    #[error("task `{task_id}` not found")]
    NotFound { task_id: String },
    #[error("task `{task_id}` did not finish within {waited_ms}ms")]
    Timeout { task_id: String, waited_ms: u128 },
}

impl ServiceError {
    /// HTTP-style status for API layers.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Guard(err) => err.status_code(),
            Self::NotFound { .. } => 404,
            _ => 500,
        }
    }
}

/// Submission, query and listing of rollout tasks.
///
/// `submit` runs the guards synchronously and hands the task to a worker;
/// callers observe the outcome by polling `query`.
pub struct RolloutService {
    engine: Arc<WorkflowEngine>,
    pool: WorkerPool,
}

impl RolloutService {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        let workers = engine.settings().workers.max_concurrency;
        let pool = WorkerPool::start(engine.clone(), workers);
        Self { engine, pool }
    }

    /// Wires the production adapters described by `settings`.
    pub fn from_settings(settings: Settings) -> Result<Self, ServiceError> {
        settings.validate()?;
        let log = EventLog::under_state_root(&settings.state_root);
        let ledger: Arc<dyn TaskLedger> = Arc::new(SqliteTaskLedger::open(&settings.ledger_path())?);
        let executor: Arc<dyn RemoteExecutor> =
            Arc::new(SshExecutor::new(settings.executor.clone()));
        let keys: Arc<dyn KeyStore> = Arc::new(EtcdKeyStore::new(&settings.key_store));
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(settings.object_storage.root.clone()));
        let engine = WorkflowEngine::new(settings, ledger, executor, keys, objects, log);
        Ok(Self::new(Arc::new(engine)))
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    fn admit(&self, operation: &Operation) -> Result<String, ServiceError> {
        let task_id = generate_task_id(now_secs()).map_err(ServiceError::TaskId)?;
        self.engine.admit(&task_id, operation)?;
        Ok(task_id)
    }

    /// Admits `operation` and queues it. Returns the new task id.
    pub fn submit(&self, operation: Operation) -> Result<String, ServiceError> {
        let task_id = self.admit(&operation)?;
        let job = TaskJob {
            task_id: task_id.clone(),
            operation: operation.clone(),
        };
        if let Err(err) = self.pool.dispatch(job) {
            let reason = err.to_string();
            self.engine
                .log()
                .task("error", &task_id, "worker.dispatch_failed", &reason);
            self.engine.abandon(&task_id, &operation, &reason);
            return Err(err.into());
        }
        Ok(task_id)
    }

    /// Admits and executes `operation` on the calling thread.
    pub fn run_inline(&self, operation: Operation) -> Result<TaskOutcome, ServiceError> {
        let task_id = self.admit(&operation)?;
        Ok(self.engine.execute(&task_id, &operation))
    }

    pub fn query(&self, task_id: &str) -> Result<Option<TaskRecord>, ServiceError> {
        Ok(self.engine.ledger().get(task_id)?)
    }

    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, ServiceError> {
        Ok(self.engine.ledger().list(filter)?)
    }

    /// Polls the ledger until `task_id` reaches `SUCCESS` or `FAILURE`.
    pub fn wait_for_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskRecord, ServiceError> {
        let started = Instant::now();
        loop {
            let record = self
                .query(task_id)?
                .ok_or_else(|| ServiceError::NotFound {
                    task_id: task_id.to_string(),
                })?;
            if record.state.is_terminal() && record.end_time.is_some() {
                return Ok(record);
            }
            if started.elapsed() >= timeout {
                return Err(ServiceError::Timeout {
                    task_id: task_id.to_string(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.pool.in_flight()
    }

    /// Waits for queued tasks, then stops the workers.
    pub fn shutdown(self) {
        self.pool.shutdown();
    }
}
