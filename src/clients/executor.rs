use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One remote action, applied to every host of a [`RemoteExecutor::run`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteModule {
    /// Runs `command` through `sh -c`.
    Shell { command: String },
    /// Installs a local file at `dest`. When `src` is a directory its regular
    /// files are installed into the `dest` directory instead.
    Copy {
        src: PathBuf,
        dest: String,
        mode: String,
        owner: String,
        group: String,
    },
    /// Downloads the remote file `src` to the local path `dest`.
    Fetch { src: String, dest: PathBuf },
    /// Removes `path` (file or directory) if present.
    FileAbsent { path: String },
}

impl RemoteModule {
    pub fn shell(command: impl Into<String>) -> Self {
        Self::Shell {
            command: command.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "shell",
            Self::Copy { .. } => "copy",
            Self::Fetch { .. } => "fetch",
            Self::FileAbsent { .. } => "file_absent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Ok,
    Failed,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostOutcome {
    pub status: HostStatus,
    pub rc: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl HostOutcome {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: HostStatus::Ok,
            rc: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(rc: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            status: HostStatus::Failed,
            rc,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            status: HostStatus::Unreachable,
            rc: None,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HostStatus::Ok
    }

    pub fn stdout_lines(&self) -> Vec<&str> {
        self.stdout
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Short human-readable reason for a non-ok outcome.
    pub fn describe(&self) -> String {
        let detail = self.stderr.trim();
        match (self.status, self.rc) {
            (HostStatus::Ok, _) => "ok".to_string(),
            (HostStatus::Unreachable, _) => format!("unreachable: {detail}"),
            (HostStatus::Failed, Some(rc)) => format!("exit {rc}: {detail}"),
            (HostStatus::Failed, None) => format!("failed: {detail}"),
        }
    }
}

/// Host-indexed results of one executor call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub hosts: BTreeMap<String, HostOutcome>,
}

impl ExecutionReport {
    pub fn insert(&mut self, host: impl Into<String>, outcome: HostOutcome) {
        self.hosts.insert(host.into(), outcome);
    }

    pub fn outcome(&self, host: &str) -> Option<&HostOutcome> {
        self.hosts.get(host)
    }

    /// `Ok` only when every host succeeded; otherwise the worst host status.
    pub fn aggregate_status(&self) -> HostStatus {
        let mut aggregate = HostStatus::Ok;
        for outcome in self.hosts.values() {
            match outcome.status {
                HostStatus::Unreachable => return HostStatus::Unreachable,
                HostStatus::Failed => aggregate = HostStatus::Failed,
                HostStatus::Ok => {}
            }
        }
        aggregate
    }

    pub fn failures(&self) -> Vec<(&str, &HostOutcome)> {
        self.hosts
            .iter()
            .filter(|(_, outcome)| !outcome.is_ok())
            .map(|(host, outcome)| (host.as_str(), outcome))
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to spawn `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid {module} request: {reason}")]
    InvalidRequest {
        module: &'static str,
        reason: String,
    },
}

/// Fleet-wide remote actuation.
///
/// Per-host failures are reported in the [`ExecutionReport`]; an `Err` means
/// the call could not be attempted at all.
pub trait RemoteExecutor: Send + Sync {
    fn run(&self, hosts: &[String], module: &RemoteModule)
        -> Result<ExecutionReport, ExecutorError>;
}

/// Quotes `raw` for POSIX `sh`.
pub fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "/._-+=:@,".contains(ch))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_leaves_plain_paths_alone() {
        assert_eq!(shell_quote("/etc/app/app.cfg"), "/etc/app/app.cfg");
        assert_eq!(shell_quote("root"), "root");
    }

    #[test]
    fn shell_quote_wraps_spaces_and_single_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn aggregate_status_reports_worst_host() {
        let mut report = ExecutionReport::default();
        report.insert("a", HostOutcome::ok(""));
        assert_eq!(report.aggregate_status(), HostStatus::Ok);
        report.insert("b", HostOutcome::failed(Some(1), "boom"));
        assert_eq!(report.aggregate_status(), HostStatus::Failed);
        report.insert("c", HostOutcome::unreachable("timeout"));
        assert_eq!(report.aggregate_status(), HostStatus::Unreachable);
        assert_eq!(report.failures().len(), 2);
    }
}
