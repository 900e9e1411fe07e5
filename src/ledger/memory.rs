use super::{apply_patch, LedgerError, TaskFilter, TaskLedger, TaskName, TaskPatch, TaskRecord};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Process-local ledger. Each call holds the lock for its whole
/// read-check-write, so patches are atomic per row.
#[derive(Debug, Default)]
pub struct MemoryTaskLedger {
    rows: Mutex<BTreeMap<String, TaskRecord>>,
}

impl MemoryTaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fully formed row, bypassing transition checks.
    pub fn seed(&self, record: TaskRecord) -> Result<(), LedgerError> {
        let mut rows = self.rows.lock().map_err(|_| LedgerError::Poisoned)?;
        rows.insert(record.task_id.clone(), record);
        Ok(())
    }
}

impl TaskLedger for MemoryTaskLedger {
    fn create(
        &self,
        task_id: &str,
        name: TaskName,
        arguments: &Value,
        now: i64,
    ) -> Result<TaskRecord, LedgerError> {
        let mut rows = self.rows.lock().map_err(|_| LedgerError::Poisoned)?;
        if rows.contains_key(task_id) {
            return Err(LedgerError::DuplicateTask {
                task_id: task_id.to_string(),
            });
        }
        let record = TaskRecord::new(task_id, name, arguments.clone(), now);
        rows.insert(task_id.to_string(), record.clone());
        Ok(record)
    }

    fn update(&self, task_id: &str, patch: &TaskPatch) -> Result<Option<TaskRecord>, LedgerError> {
        let mut rows = self.rows.lock().map_err(|_| LedgerError::Poisoned)?;
        let Some(existing) = rows.get(task_id) else {
            return Ok(None);
        };
        let mut next = existing.clone();
        apply_patch(&mut next, patch).map_err(|source| LedgerError::Transition {
            task_id: task_id.to_string(),
            source,
        })?;
        rows.insert(task_id.to_string(), next.clone());
        Ok(Some(next))
    }

    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, LedgerError> {
        let rows = self.rows.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(rows.get(task_id).cloned())
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, LedgerError> {
        let rows = self.rows.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut matching = rows
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| {
            b.begin_time
                .cmp(&a.begin_time)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });
        Ok(matching)
    }
}
