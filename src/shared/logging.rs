use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only JSON-lines event log. Write failures are swallowed so that
/// logging never changes the outcome of the caller.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: Option<PathBuf>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn under_state_root(state_root: &Path) -> Self {
        Self::new(state_root.join("logs/confwave.log"))
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, event: &str, message: &str) {
        self.append("info", event, message, None);
    }

    pub fn warn(&self, event: &str, message: &str) {
        self.append("warn", event, message, None);
    }

    pub fn error(&self, event: &str, message: &str) {
        self.append("error", event, message, None);
    }

    pub fn task(&self, level: &str, task_id: &str, event: &str, message: &str) {
        self.append(level, event, message, Some(task_id));
    }

    fn append(&self, level: &str, event: &str, message: &str, task_id: Option<&str>) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        let mut payload = Map::new();
        payload.insert("timestamp".to_string(), Value::from(super::now_secs()));
        payload.insert("level".to_string(), Value::from(level));
        payload.insert("event".to_string(), Value::from(event));
        if let Some(task_id) = task_id {
            payload.insert("task_id".to_string(), Value::from(task_id));
        }
        payload.insert("message".to_string(), Value::from(message));

        let Ok(line) = serde_json::to_string(&Value::Object(payload)) else {
            return;
        };
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}
