use crate::clients::{shell_quote, ExecutionReport, HostOutcome, RemoteExecutor, RemoteModule};
use crate::config::{AgentAction, AgentSettings, FileOwner};
use crate::rollout::error::RolloutError;
use crate::shared::EventLog;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Numeric ids an owner name/group resolves to on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerIds {
    pub uid: u32,
    pub gid: u32,
}

/// `stat` fields of a remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileStat {
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub modified: String,
}

pub fn list_dir_command(dir: &str) -> String {
    format!("ls -1A -- {} 2>/dev/null || true", shell_quote(dir))
}

pub fn read_file_command(path: &str) -> String {
    format!("cat -- {}", shell_quote(path))
}

pub fn stat_command(path: &str) -> String {
    format!("stat -c '%A %U %G %y' -- {}", shell_quote(path))
}

/// Prints `uid=N` and `gid=N` lines; an unknown name leaves its value empty.
pub fn owner_ids_command(owner: &FileOwner) -> String {
    format!(
        "echo uid=$(getent passwd {} | cut -d: -f3); echo gid=$(getent group {} | cut -d: -f3)",
        shell_quote(&owner.name),
        shell_quote(&owner.group)
    )
}

/// Drives the host-local agent and its managed files through the executor.
///
/// Mutating calls fail on the first host that does not report success.
/// Reads (`read_file`, `stat`, `fetch`) report per-host absence instead.
#[derive(Clone)]
pub struct AgentController {
    executor: Arc<dyn RemoteExecutor>,
    agent: AgentSettings,
    log: EventLog,
}

impl AgentController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, agent: AgentSettings, log: EventLog) -> Self {
        Self {
            executor,
            agent,
            log,
        }
    }

    fn run_strict(
        &self,
        hosts: &[String],
        module: &RemoteModule,
    ) -> Result<ExecutionReport, RolloutError> {
        let report = self.executor.run(hosts, module)?;
        for host in hosts {
            match report.outcome(host) {
                Some(outcome) if outcome.is_ok() => {}
                Some(outcome) => {
                    return Err(RolloutError::Remote {
                        module: module.name(),
                        host: host.clone(),
                        reason: outcome.describe(),
                    })
                }
                None => {
                    return Err(RolloutError::Remote {
                        module: module.name(),
                        host: host.clone(),
                        reason: "no result reported".to_string(),
                    })
                }
            }
        }
        Ok(report)
    }

    /// Runs the configured start/stop/restart/status command fleet-wide.
    pub fn command(
        &self,
        hosts: &[String],
        action: AgentAction,
    ) -> Result<ExecutionReport, RolloutError> {
        let command = self.agent.commands.command(action).to_string();
        let report = self.run_strict(hosts, &RemoteModule::shell(command))?;
        self.log.info(
            &format!("agent.{action}"),
            &format!("agent {action} succeeded on {}", hosts.join(",")),
        );
        Ok(report)
    }

    /// Installs the files of `local_dir` into `remote_dir` with the agent's
    /// file mode and owner.
    pub fn push_dir(&self, host: &str, local_dir: &Path, remote_dir: &str) -> Result<(), RolloutError> {
        self.run_strict(
            &[host.to_string()],
            &RemoteModule::Copy {
                src: local_dir.to_path_buf(),
                dest: remote_dir.to_string(),
                mode: self.agent.file_mode.clone(),
                owner: self.agent.owner.name.clone(),
                group: self.agent.owner.group.clone(),
            },
        )?;
        Ok(())
    }

    /// Installs one file at `dest` with explicit mode and owner.
    pub fn install_file(
        &self,
        host: &str,
        local: &Path,
        dest: &str,
        mode: &str,
        owner: &FileOwner,
    ) -> Result<(), RolloutError> {
        self.run_strict(
            &[host.to_string()],
            &RemoteModule::Copy {
                src: local.to_path_buf(),
                dest: dest.to_string(),
                mode: mode.to_string(),
                owner: owner.name.clone(),
                group: owner.group.clone(),
            },
        )?;
        Ok(())
    }

    pub fn remove(&self, host: &str, path: &str) -> Result<(), RolloutError> {
        self.run_strict(
            &[host.to_string()],
            &RemoteModule::FileAbsent {
                path: path.to_string(),
            },
        )?;
        Ok(())
    }

    /// Downloads `remote` to `local`. Returns `false` when the host could not
    /// supply the file.
    pub fn fetch(&self, host: &str, remote: &str, local: &Path) -> Result<bool, RolloutError> {
        let report = self.executor.run(
            &[host.to_string()],
            &RemoteModule::Fetch {
                src: remote.to_string(),
                dest: local.to_path_buf(),
            },
        )?;
        Ok(report.outcome(host).is_some_and(HostOutcome::is_ok) && local.is_file())
    }

    /// Entry names of `dir`; a missing directory lists as empty.
    pub fn list_dir(&self, host: &str, dir: &str) -> Result<Vec<String>, RolloutError> {
        let report = self.run_strict(&[host.to_string()], &RemoteModule::shell(list_dir_command(dir)))?;
        let mut names = report
            .outcome(host)
            .map(|outcome| {
                outcome
                    .stdout_lines()
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    /// Content of `path` per host; `None` where it could not be read.
    pub fn read_file(
        &self,
        hosts: &[String],
        path: &str,
    ) -> Result<BTreeMap<String, Option<String>>, RolloutError> {
        let report = self
            .executor
            .run(hosts, &RemoteModule::shell(read_file_command(path)))?;
        Ok(hosts
            .iter()
            .map(|host| {
                let content = report
                    .outcome(host)
                    .filter(|outcome| outcome.is_ok())
                    .map(|outcome| outcome.stdout.clone());
                (host.clone(), content)
            })
            .collect())
    }

    pub fn stat(
        &self,
        hosts: &[String],
        path: &str,
    ) -> Result<BTreeMap<String, Option<RemoteFileStat>>, RolloutError> {
        let report = self
            .executor
            .run(hosts, &RemoteModule::shell(stat_command(path)))?;
        Ok(hosts
            .iter()
            .map(|host| {
                let stat = report
                    .outcome(host)
                    .filter(|outcome| outcome.is_ok())
                    .and_then(|outcome| parse_stat_line(outcome.stdout.trim()));
                (host.clone(), stat)
            })
            .collect())
    }

    /// Resolves `owner` to uid/gid on every host.
    pub fn resolve_owner_ids(
        &self,
        hosts: &[String],
        owner: &FileOwner,
    ) -> Result<BTreeMap<String, OwnerIds>, RolloutError> {
        let report = self.run_strict(hosts, &RemoteModule::shell(owner_ids_command(owner)))?;
        let mut resolved = BTreeMap::new();
        for host in hosts {
            let lines = report
                .outcome(host)
                .map(HostOutcome::stdout_lines)
                .unwrap_or_default();
            let parse = |what: &str| {
                let label = format!("{what}=");
                lines
                    .iter()
                    .find_map(|line| line.strip_prefix(label.as_str()))
                    .and_then(|value| value.trim().parse::<u32>().ok())
                    .ok_or_else(|| RolloutError::RemoteOutput {
                        host: host.clone(),
                        action: "resolving owner ids",
                        reason: format!("{what} of `{owner}` not found"),
                    })
            };
            let uid = parse("uid")?;
            let gid = parse("gid")?;
            resolved.insert(host.clone(), OwnerIds { uid, gid });
        }
        Ok(resolved)
    }
}

/// Parses `stat -c '%A %U %G %y'` output, e.g.
/// `-rw-r--r-- root root 2024-01-02 03:04:05.000000000 +0000`.
pub fn parse_stat_line(line: &str) -> Option<RemoteFileStat> {
    let mut parts = line.splitn(4, ' ');
    let permissions = parts.next()?.to_string();
    let owner = parts.next()?.to_string();
    let group = parts.next()?.to_string();
    let modified = parts.next()?.trim().to_string();
    if permissions.len() < 10 {
        return None;
    }
    Some(RemoteFileStat {
        permissions,
        owner,
        group,
        modified,
    })
}
