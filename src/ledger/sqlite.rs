use super::{
    apply_patch, AckFilter, AckStatus, LedgerError, ProgressInfo, TaskFilter, TaskLedger,
    TaskName, TaskPatch, TaskRecord, TaskState, UpdateStep,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SELECT_COLUMNS: &str = "task_id, name, arguments, begin_time, end_time, elapsed, state, \
     info, ack_status, step, sub_task_id";

/// SQLite-backed ledger. Updates run inside an immediate transaction so the
/// transition check and the write cannot interleave with another writer.
pub struct SqliteTaskLedger {
    db_path: PathBuf,
}

struct RawTaskRow {
    task_id: String,
    name: String,
    arguments: String,
    begin_time: i64,
    end_time: Option<i64>,
    elapsed: Option<f64>,
    state: String,
    info: Option<String>,
    ack_status: Option<String>,
    step: i64,
    sub_task_id: Option<String>,
}

impl SqliteTaskLedger {
    pub fn open(db_path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| LedgerError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let ledger = Self {
            db_path: db_path.to_path_buf(),
        };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<(), LedgerError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    task_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    arguments TEXT NOT NULL,
                    begin_time INTEGER NOT NULL,
                    end_time INTEGER,
                    elapsed REAL,
                    state TEXT NOT NULL,
                    info TEXT,
                    ack_status TEXT,
                    step INTEGER NOT NULL DEFAULT 0,
                    sub_task_id TEXT REFERENCES tasks(task_id)
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_name_ack
                    ON tasks(name, ack_status);
                CREATE INDEX IF NOT EXISTS idx_tasks_begin_time
                    ON tasks(begin_time DESC);
                ",
            )
            .map_err(|source| LedgerError::Sql { source })
    }

    fn connect(&self) -> Result<Connection, LedgerError> {
        let connection = Connection::open(&self.db_path).map_err(|source| LedgerError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .map_err(|source| LedgerError::Sql { source })?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|source| LedgerError::Sql { source })?;
        Ok(connection)
    }
}

impl TaskLedger for SqliteTaskLedger {
    fn create(
        &self,
        task_id: &str,
        name: TaskName,
        arguments: &Value,
        now: i64,
    ) -> Result<TaskRecord, LedgerError> {
        let record = TaskRecord::new(task_id, name, arguments.clone(), now);
        let arguments_json = serde_json::to_string(arguments).map_err(|source| LedgerError::Json {
            task_id: task_id.to_string(),
            source,
        })?;
        let connection = self.connect()?;
        let inserted = connection
            .execute(
                "
                INSERT INTO tasks (task_id, name, arguments, begin_time, state, step)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(task_id) DO NOTHING
                ",
                params![
                    record.task_id,
                    record.name.as_str(),
                    arguments_json,
                    record.begin_time,
                    record.state.as_str(),
                    u8::from(record.step),
                ],
            )
            .map_err(|source| LedgerError::Sql { source })?;
        if inserted == 0 {
            return Err(LedgerError::DuplicateTask {
                task_id: task_id.to_string(),
            });
        }
        Ok(record)
    }

    fn update(&self, task_id: &str, patch: &TaskPatch) -> Result<Option<TaskRecord>, LedgerError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| LedgerError::Sql { source })?;

        let raw = tx
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id],
                read_raw_row,
            )
            .optional()
            .map_err(|source| LedgerError::Sql { source })?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut record = decode_row(raw)?;
        apply_patch(&mut record, patch).map_err(|source| LedgerError::Transition {
            task_id: task_id.to_string(),
            source,
        })?;

        let info_json = record
            .info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|source| LedgerError::Json {
                task_id: task_id.to_string(),
                source,
            })?;
        tx.execute(
            "
            UPDATE tasks SET
                end_time = ?2,
                elapsed = ?3,
                state = ?4,
                info = ?5,
                ack_status = ?6,
                step = ?7,
                sub_task_id = ?8
            WHERE task_id = ?1
            ",
            params![
                record.task_id,
                record.end_time,
                record.elapsed,
                record.state.as_str(),
                info_json,
                record.ack_status.map(AckStatus::as_str),
                u8::from(record.step),
                record.sub_task_id,
            ],
        )
        .map_err(|source| LedgerError::Sql { source })?;
        tx.commit().map_err(|source| LedgerError::Sql { source })?;
        Ok(Some(record))
    }

    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, LedgerError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id],
                read_raw_row,
            )
            .optional()
            .map_err(|source| LedgerError::Sql { source })?;
        raw.map(decode_row).transpose()
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, LedgerError> {
        let mut clauses = Vec::new();
        let mut values: Vec<&'static str> = Vec::new();
        if let Some(name) = filter.name {
            values.push(name.as_str());
            clauses.push(format!("name = ?{}", values.len()));
        }
        if let Some(state) = filter.state {
            values.push(state.as_str());
            clauses.push(format!("state = ?{}", values.len()));
        }
        match filter.ack_status {
            None => {}
            Some(AckFilter::Unset) => clauses.push("ack_status IS NULL".to_string()),
            Some(AckFilter::Is(status)) => {
                values.push(status.as_str());
                clauses.push(format!("ack_status = ?{}", values.len()));
            }
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let connection = self.connect()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM tasks {where_clause} \
                 ORDER BY begin_time DESC, task_id DESC"
            ))
            .map_err(|source| LedgerError::Sql { source })?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), read_raw_row)
            .map_err(|source| LedgerError::Sql { source })?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.map_err(|source| LedgerError::Sql { source })?;
            records.push(decode_row(raw)?);
        }
        Ok(records)
    }
}

fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTaskRow> {
    Ok(RawTaskRow {
        task_id: row.get(0)?,
        name: row.get(1)?,
        arguments: row.get(2)?,
        begin_time: row.get(3)?,
        end_time: row.get(4)?,
        elapsed: row.get(5)?,
        state: row.get(6)?,
        info: row.get(7)?,
        ack_status: row.get(8)?,
        step: row.get(9)?,
        sub_task_id: row.get(10)?,
    })
}

fn decode_row(raw: RawTaskRow) -> Result<TaskRecord, LedgerError> {
    let invalid = |column: &'static str, value: String| LedgerError::InvalidColumn {
        task_id: raw.task_id.clone(),
        column,
        value,
    };
    let name = TaskName::parse(&raw.name).map_err(|_| invalid("name", raw.name.clone()))?;
    let state = TaskState::parse(&raw.state).ok_or_else(|| invalid("state", raw.state.clone()))?;
    let ack_status = match raw.ack_status.as_deref() {
        None => None,
        Some(value) => {
            Some(AckStatus::parse(value).ok_or_else(|| invalid("ack_status", value.to_string()))?)
        }
    };
    let step = u8::try_from(raw.step)
        .ok()
        .and_then(|value| UpdateStep::try_from(value).ok())
        .ok_or_else(|| invalid("step", raw.step.to_string()))?;
    let arguments: Value =
        serde_json::from_str(&raw.arguments).map_err(|source| LedgerError::Json {
            task_id: raw.task_id.clone(),
            source,
        })?;
    let info: Option<ProgressInfo> = raw
        .info
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|source| LedgerError::Json {
            task_id: raw.task_id.clone(),
            source,
        })?;

    Ok(TaskRecord {
        task_id: raw.task_id,
        name,
        arguments,
        begin_time: raw.begin_time,
        end_time: raw.end_time,
        elapsed: raw.elapsed,
        state,
        info,
        ack_status,
        step,
        sub_task_id: raw.sub_task_id,
    })
}
