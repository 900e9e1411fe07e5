use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    pub state_root: PathBuf,
    pub staging: StagingSettings,
    pub agent: AgentSettings,
    pub key_store: KeyStoreSettings,
    pub object_storage: ObjectStorageSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StagingSettings {
    /// Freshly built descriptors and templates.
    pub tmp_dir: PathBuf,
    /// Local mirror of the object-storage snapshots.
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct FileOwner {
    pub name: String,
    pub group: String,
}

impl std::fmt::Display for FileOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.group)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentSettings {
    /// Agent home; descriptors live in `conf.d/`, templates in `templates/`.
    pub root_dir: String,
    #[serde(default = "default_agent_file_mode")]
    pub file_mode: String,
    pub owner: FileOwner,
    pub commands: AgentCommands,
}

impl AgentSettings {
    pub fn descriptor_dir(&self) -> String {
        format!("{}/conf.d", self.root_dir.trim_end_matches('/'))
    }

    pub fn template_dir(&self) -> String {
        format!("{}/templates", self.root_dir.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    Start,
    Stop,
    Restart,
    Status,
}

impl AgentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Status => "status",
        }
    }
}

impl std::fmt::Display for AgentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentCommands {
    pub start: String,
    pub stop: String,
    pub restart: String,
    pub status: String,
}

impl AgentCommands {
    pub fn command(&self, action: AgentAction) -> &str {
        match action {
            AgentAction::Start => &self.start,
            AgentAction::Stop => &self.stop,
            AgentAction::Restart => &self.restart,
            AgentAction::Status => &self.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeyStoreSettings {
    pub endpoint: String,
    #[serde(default = "default_backup_prefix")]
    pub backup_prefix: String,
    #[serde(default = "default_key_store_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObjectStorageSettings {
    pub root: PathBuf,
    pub bucket: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_remote_user")]
    pub remote_user: String,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub become_root: bool,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    #[serde(default = "default_scp_binary")]
    pub scp_binary: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            remote_user: default_remote_user(),
            ssh_key: None,
            become_root: true,
            ssh_binary: default_ssh_binary(),
            scp_binary: default_scp_binary(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerSettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_agent_file_mode() -> String {
    "0775".to_string()
}

fn default_backup_prefix() -> String {
    "bak".to_string()
}

fn default_key_store_timeout_secs() -> u64 {
    10
}

fn default_remote_user() -> String {
    "root".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_scp_binary() -> String {
    "scp".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_concurrency() -> usize {
    4
}

/// Accepts three or four octal digits, e.g. `644` or `0755`.
pub fn is_octal_mode(raw: &str) -> bool {
    (3..=4).contains(&raw.len()) && raw.chars().all(|ch| ('0'..='7').contains(&ch))
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_root.join("ledger.sqlite")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, path) in [
            ("state_root", &self.state_root),
            ("staging.tmp_dir", &self.staging.tmp_dir),
            ("staging.data_dir", &self.staging.data_dir),
            ("object_storage.root", &self.object_storage.root),
        ] {
            if !path.is_absolute() {
                return Err(ConfigError::Settings(format!(
                    "`{field}` must be an absolute path"
                )));
            }
        }
        if !self.agent.root_dir.starts_with('/') {
            return Err(ConfigError::Settings(
                "`agent.root_dir` must be an absolute path".to_string(),
            ));
        }
        if !is_octal_mode(&self.agent.file_mode) {
            return Err(ConfigError::Settings(format!(
                "`agent.file_mode` must be an octal mode, got `{}`",
                self.agent.file_mode
            )));
        }
        if self.agent.owner.name.trim().is_empty() || self.agent.owner.group.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`agent.owner` requires both name and group".to_string(),
            ));
        }
        for action in [
            AgentAction::Start,
            AgentAction::Stop,
            AgentAction::Restart,
            AgentAction::Status,
        ] {
            if self.agent.commands.command(action).trim().is_empty() {
                return Err(ConfigError::Settings(format!(
                    "`agent.commands.{action}` must be non-empty"
                )));
            }
        }
        if self.key_store.endpoint.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`key_store.endpoint` must be non-empty".to_string(),
            ));
        }
        let backup_prefix = self.key_store.backup_prefix.trim_matches('/');
        if backup_prefix.is_empty() || backup_prefix.contains('/') {
            return Err(ConfigError::Settings(
                "`key_store.backup_prefix` must be a single non-empty path segment".to_string(),
            ));
        }
        if self.object_storage.bucket.trim().is_empty() || self.object_storage.bucket.contains('/')
        {
            return Err(ConfigError::Settings(
                "`object_storage.bucket` must be a non-empty name without `/`".to_string(),
            ));
        }
        if self.workers.max_concurrency == 0 {
            return Err(ConfigError::Settings(
                "`workers.max_concurrency` must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
