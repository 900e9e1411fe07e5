pub mod error;
pub mod memory;
pub mod record;
pub mod sqlite;

pub use error::LedgerError;
pub use memory::MemoryTaskLedger;
pub use record::{
    apply_patch, AckFilter, AckStatus, ProgressInfo, TaskFilter, TaskName, TaskPatch, TaskRecord,
    TaskState, TransitionError, UpdateStep, PROGRESS_TOTAL,
};
pub use sqlite::SqliteTaskLedger;

use serde_json::Value;

/// Durable record of every workflow run.
///
/// Every mutation goes through [`apply_patch`], so implementations share the
/// same transition rules for `state`, `step`, `ack_status` and `sub_task_id`.
pub trait TaskLedger: Send + Sync {
    /// Inserts a new `PENDING` row. Ids are supplied by the caller.
    fn create(
        &self,
        task_id: &str,
        name: TaskName,
        arguments: &Value,
        now: i64,
    ) -> Result<TaskRecord, LedgerError>;

    /// Applies `patch` atomically. Returns `Ok(None)` for an unknown id.
    fn update(&self, task_id: &str, patch: &TaskPatch) -> Result<Option<TaskRecord>, LedgerError>;

    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, LedgerError>;

    /// Rows matching `filter`, newest `begin_time` first.
    fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, LedgerError>;
}
