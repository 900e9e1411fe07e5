use super::record::TransitionError;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("task `{task_id}` already exists")]
    DuplicateTask { task_id: String },
    #[error("task `{task_id}` rejected update: {source}")]
    Transition {
        task_id: String,
        #[source]
        source: TransitionError,
    },
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create ledger database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid {column} value `{value}` in ledger row `{task_id}`")]
    InvalidColumn {
        task_id: String,
        column: &'static str,
        value: String,
    },
    #[error("ledger json error for task `{task_id}`: {source}")]
    Json {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("ledger lock poisoned")]
    Poisoned,
}
