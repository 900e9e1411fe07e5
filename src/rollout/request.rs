use crate::config::settings::is_octal_mode;
use crate::config::FileOwner;
use crate::ledger::TaskName;
use crate::rollout::error::{GuardError, RolloutError};
use crate::rollout::rawfile::{FIELD_SEPARATOR, PATH_SEPARATOR, SLASH_MARKER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The (service, environment, version) triple one rollout targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub service: String,
    pub environment: String,
    pub version: String,
}

impl Coordinate {
    pub fn new(
        service: impl Into<String>,
        environment: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            environment: environment.into(),
            version: version.into(),
        }
    }

    /// Version with whitespace runs collapsed to `_`.
    pub fn version_segment(&self) -> String {
        self.version.split_whitespace().collect::<Vec<_>>().join("_")
    }

    /// `{env}/{service}/{version}`, the key-space and storage path segment.
    pub fn folder(&self) -> String {
        format!(
            "{}/{}/{}",
            self.environment,
            self.service,
            self.version_segment()
        )
    }

    /// `{env}.{service}.{version}`, the descriptor file name prefix.
    pub fn file_pre(&self) -> String {
        format!(
            "{}.{}.{}",
            self.environment,
            self.service,
            self.version_segment()
        )
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.folder())
    }
}

/// One managed file: where it lands, who owns it, and how it renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub name: String,
    pub dir: String,
    pub mode: String,
    pub owner: FileOwner,
    pub template: String,
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

impl ConfigFile {
    pub fn dest_path(&self) -> String {
        format!("{}/{}", self.dir.trim_end_matches('/'), self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub service_name: String,
    pub env_name: String,
    pub service_version: String,
    #[serde(default)]
    pub check_cmd: String,
    #[serde(default)]
    pub reload_cmd: String,
    pub files: Vec<ConfigFile>,
    pub hosts: Vec<String>,
}

impl UpdateRequest {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(&self.service_name, &self.env_name, &self.service_version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub files: Vec<ConfigFile>,
    pub hosts: Vec<String>,
}

/// Arguments of an acknowledge or rollback run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpRequest {
    pub main_task_id: String,
}

/// Closed registry of the runnable operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Update(UpdateRequest),
    Check(CheckRequest),
    Acknowledge(FollowUpRequest),
    Rollback(FollowUpRequest),
}

impl Operation {
    pub fn name(&self) -> TaskName {
        match self {
            Self::Update(_) => TaskName::Update,
            Self::Check(_) => TaskName::Check,
            Self::Acknowledge(_) => TaskName::Acknowledge,
            Self::Rollback(_) => TaskName::Rollback,
        }
    }

    /// Serialized request, as stored in the ledger's `arguments` column.
    pub fn arguments(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Update(request) => serde_json::to_value(request),
            Self::Check(request) => serde_json::to_value(request),
            Self::Acknowledge(request) | Self::Rollback(request) => {
                serde_json::to_value(request)
            }
        }
    }

    pub fn decode(name: TaskName, arguments: &Value) -> Result<Self, RolloutError> {
        let wrap = |source| RolloutError::Arguments { task: name, source };
        Ok(match name {
            TaskName::Update => {
                Self::Update(serde_json::from_value(arguments.clone()).map_err(wrap)?)
            }
            TaskName::Check => {
                Self::Check(serde_json::from_value(arguments.clone()).map_err(wrap)?)
            }
            TaskName::Acknowledge => {
                Self::Acknowledge(serde_json::from_value(arguments.clone()).map_err(wrap)?)
            }
            TaskName::Rollback => {
                Self::Rollback(serde_json::from_value(arguments.clone()).map_err(wrap)?)
            }
        })
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        match self {
            Self::Update(request) => {
                for (field, value) in [
                    ("service_name", &request.service_name),
                    ("env_name", &request.env_name),
                    ("service_version", &request.service_version),
                ] {
                    if value.trim().is_empty() {
                        return Err(GuardError::InvalidAccess(format!(
                            "`{field}` must be non-empty"
                        )));
                    }
                    if value.contains('/') {
                        return Err(GuardError::InvalidAccess(format!(
                            "`{field}` must not contain `/`, got `{value}`"
                        )));
                    }
                }
                validate_files(&request.files)?;
                validate_hosts(&request.hosts)
            }
            Self::Check(request) => {
                validate_files(&request.files)?;
                validate_hosts(&request.hosts)
            }
            Self::Acknowledge(request) | Self::Rollback(request) => {
                if request.main_task_id.trim().is_empty() {
                    return Err(GuardError::InvalidAccess(
                        "`main_task_id` must be non-empty".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_files(files: &[ConfigFile]) -> Result<(), GuardError> {
    if files.is_empty() {
        return Err(GuardError::InvalidAccess(
            "at least one file is required".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for file in files {
        if file.name.trim().is_empty() || file.name.contains('/') {
            return Err(GuardError::InvalidAccess(format!(
                "file name `{}` must be non-empty and must not contain `/`",
                file.name
            )));
        }
        if !seen.insert(file.name.as_str()) {
            return Err(GuardError::InvalidAccess(format!(
                "file name `{}` is declared more than once",
                file.name
            )));
        }
        if !file.dir.starts_with('/') {
            return Err(GuardError::InvalidAccess(format!(
                "dir `{}` of `{}` must be absolute",
                file.dir, file.name
            )));
        }
        if !is_octal_mode(&file.mode) {
            return Err(GuardError::InvalidAccess(format!(
                "mode `{}` of `{}` must be octal",
                file.mode, file.name
            )));
        }
        if file.owner.name.trim().is_empty() || file.owner.group.trim().is_empty() {
            return Err(GuardError::InvalidAccess(format!(
                "owner of `{}` requires name and group",
                file.name
            )));
        }
        for (field, value) in [("owner name", &file.owner.name), ("owner group", &file.owner.group)] {
            if let Some(token) = reserved_token(value, &[FIELD_SEPARATOR, PATH_SEPARATOR]) {
                return Err(GuardError::InvalidAccess(format!(
                    "{field} `{value}` of `{}` must not contain `{token}`",
                    file.name
                )));
            }
        }
        for (field, value) in [("dir", &file.dir), ("name", &file.name)] {
            if let Some(token) = reserved_token(value, &[SLASH_MARKER, PATH_SEPARATOR]) {
                return Err(GuardError::InvalidAccess(format!(
                    "{field} `{value}` of `{}` must not contain `{token}`",
                    file.name
                )));
            }
        }
        if let Some(key) = file
            .items
            .keys()
            .find(|key| key.is_empty() || key.contains('/'))
        {
            return Err(GuardError::InvalidAccess(format!(
                "item key `{key}` of `{}` must be a single non-empty segment",
                file.name
            )));
        }
    }
    Ok(())
}

/// Snapshot object names embed owner and path, so these tokens cannot appear in them.
fn reserved_token<'t>(value: &str, tokens: &[&'t str]) -> Option<&'t str> {
    tokens.iter().copied().find(|token| value.contains(token))
}

fn validate_hosts(hosts: &[String]) -> Result<(), GuardError> {
    if hosts.is_empty() {
        return Err(GuardError::InvalidAccess(
            "at least one host is required".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for host in hosts {
        if host.trim().is_empty() || host.contains('/') {
            return Err(GuardError::InvalidAccess(format!("invalid host `{host}`")));
        }
        if !seen.insert(host.as_str()) {
            return Err(GuardError::InvalidAccess(format!(
                "host `{host}` is listed more than once"
            )));
        }
    }
    Ok(())
}
