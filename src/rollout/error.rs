use crate::clients::{ExecutorError, KeyStoreError, ObjectStoreError};
use crate::ledger::{LedgerError, TaskName};
use crate::rollout::layout::ArtifactClass;

/// Failures raised while a workflow step runs. Every variant finalizes the
/// task as `FAILURE`; the rendered message becomes `info.error`.
#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error(
        "backup integrity check failed for {class} snapshot on {host}: missing [{}], unexpected [{}]",
        .missing.join(", "),
        .unexpected.join(", ")
    )]
    BackupIntegrity {
        host: String,
        class: ArtifactClass,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("placeholder pattern for item `{key}` is invalid: {reason}")]
    Placeholder { key: String, reason: String },
    #[error("snapshot object `{name}` is unusable: {reason}")]
    CorruptSnapshot { name: String, reason: String },
    #[error("remote {module} failed on {host}: {reason}")]
    Remote {
        module: &'static str,
        host: String,
        reason: String,
    },
    #[error("unexpected output from {host} while {action}: {reason}")]
    RemoteOutput {
        host: String,
        action: &'static str,
        reason: String,
    },
    #[error("executor error: {source}")]
    Executor {
        #[source]
        source: ExecutorError,
    },
    #[error("key store error: {source}")]
    KeyStore {
        #[source]
        source: KeyStoreError,
    },
    #[error("object store error: {source}")]
    ObjectStore {
        #[source]
        source: ObjectStoreError,
    },
    #[error("ledger error: {source}")]
    Ledger {
        #[source]
        source: LedgerError,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("arguments of `{task}` task do not decode: {source}")]
    Arguments {
        task: TaskName,
        #[source]
        source: serde_json::Error,
    },
    #[error("task `{task_id}` is a {name} task, not an update")]
    NotAnUpdate { task_id: String, name: TaskName },
    #[error("task `{task_id}` is missing from the ledger")]
    TaskMissing { task_id: String },
    #[error("failed to serialize result of step `{step}`: {source}")]
    StepResult {
        step: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("workflow step panicked: {0}")]
    Panicked(String),
    #[error("task was not dispatched: {0}")]
    NotDispatched(String),
}

impl RolloutError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<ExecutorError> for RolloutError {
    fn from(source: ExecutorError) -> Self {
        Self::Executor { source }
    }
}

impl From<KeyStoreError> for RolloutError {
    fn from(source: KeyStoreError) -> Self {
        Self::KeyStore { source }
    }
}

impl From<ObjectStoreError> for RolloutError {
    fn from(source: ObjectStoreError) -> Self {
        Self::ObjectStore { source }
    }
}

impl From<LedgerError> for RolloutError {
    fn from(source: LedgerError) -> Self {
        Self::Ledger { source }
    }
}

/// Rejections raised synchronously to the submitter, before any step runs.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Invalid Access: {0}")]
    InvalidAccess(String),
    #[error("Task Constraint Conflict: {0}")]
    ConstraintConflict(String),
    #[error("Object Not Found: {0}")]
    ObjectNotFound(String),
    #[error("ledger unavailable: {source}")]
    Ledger {
        #[source]
        source: LedgerError,
    },
}

impl GuardError {
    /// HTTP-style status for API layers.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidAccess(_) => 400,
            Self::ConstraintConflict(_) => 403,
            Self::ObjectNotFound(_) => 404,
            Self::Ledger { .. } => 500,
        }
    }
}

impl From<LedgerError> for GuardError {
    fn from(source: LedgerError) -> Self {
        Self::Ledger { source }
    }
}
