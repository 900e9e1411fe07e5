#![allow(dead_code)]

use confwave::clients::{
    ExecutionReport, ExecutorError, FsObjectStore, HostOutcome, MemoryKeyStore, RemoteExecutor,
    RemoteModule,
};
use confwave::config::{AgentCommands, Settings};
use confwave::ledger::MemoryTaskLedger;
use confwave::rollout::{ConfigFile, UpdateRequest, WorkflowEngine};
use confwave::shared::fs::list_file_names;
use confwave::shared::EventLog;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const AGENT_ROOT: &str = "/apps/confd";
pub const DESCRIPTOR_DIR: &str = "/apps/confd/conf.d";
pub const TEMPLATE_ROOT: &str = "/apps/confd/templates";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    pub content: String,
    pub mode: String,
    pub owner: String,
    pub group: String,
}

#[derive(Debug, Default)]
struct FakeHost {
    files: BTreeMap<String, FakeFile>,
    users: BTreeMap<String, u32>,
    groups: BTreeMap<String, u32>,
    agent_running: bool,
}

#[derive(Debug, Default)]
struct FleetState {
    hosts: BTreeMap<String, FakeHost>,
    shell_log: Vec<(String, String)>,
    unreachable: BTreeSet<String>,
    failing_fetches: Vec<String>,
    failing_commands: Vec<String>,
}

/// In-memory fleet answering the commands the agent controller issues.
pub struct FakeFleet {
    commands: AgentCommands,
    state: Mutex<FleetState>,
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    match raw.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        Some(inner) => inner.replace(r"'\''", "'"),
        None => raw.to_string(),
    }
}

/// `0644` -> `-rw-r--r--`.
pub fn permissions_of(mode: &str) -> String {
    let digits = format!("{:0>4}", mode);
    let mut out = String::from("-");
    for ch in digits.chars().skip(1) {
        let bits = ch.to_digit(8).unwrap_or(0);
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}

impl FakeFleet {
    pub fn new(commands: AgentCommands, hosts: &[&str]) -> Self {
        let mut state = FleetState::default();
        for host in hosts {
            let mut fake = FakeHost {
                agent_running: true,
                ..FakeHost::default()
            };
            fake.users.insert("root".to_string(), 0);
            fake.groups.insert("root".to_string(), 0);
            fake.users.insert("web".to_string(), 1001);
            fake.groups.insert("web".to_string(), 1002);
            state.hosts.insert((*host).to_string(), fake);
        }
        Self {
            commands,
            state: Mutex::new(state),
        }
    }

    pub fn put_file(&self, host: &str, path: &str, content: &str, mode: &str, owner: &str) {
        let mut state = self.state.lock().expect("fleet lock");
        let host = state.hosts.get_mut(host).expect("known host");
        host.files.insert(
            path.to_string(),
            FakeFile {
                content: content.to_string(),
                mode: mode.to_string(),
                owner: owner.to_string(),
                group: owner.to_string(),
            },
        );
    }

    pub fn file(&self, host: &str, path: &str) -> Option<FakeFile> {
        let state = self.state.lock().expect("fleet lock");
        state.hosts.get(host)?.files.get(path).cloned()
    }

    pub fn paths_under(&self, host: &str, dir: &str) -> Vec<String> {
        let state = self.state.lock().expect("fleet lock");
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        state
            .hosts
            .get(host)
            .map(|host| {
                host.files
                    .keys()
                    .filter(|path| path.starts_with(&prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn agent_running(&self, host: &str) -> bool {
        let state = self.state.lock().expect("fleet lock");
        state.hosts.get(host).is_some_and(|host| host.agent_running)
    }

    /// Shell commands run so far, as (host, command).
    pub fn shell_log(&self) -> Vec<(String, String)> {
        self.state.lock().expect("fleet lock").shell_log.clone()
    }

    pub fn ran_command(&self, command: &str) -> bool {
        self.shell_log().iter().any(|(_, ran)| ran == command)
    }

    pub fn set_unreachable(&self, host: &str) {
        let mut state = self.state.lock().expect("fleet lock");
        state.unreachable.insert(host.to_string());
    }

    /// Makes every fetch whose remote path contains `needle` fail.
    pub fn fail_fetches_containing(&self, needle: &str) {
        let mut state = self.state.lock().expect("fleet lock");
        state.failing_fetches.push(needle.to_string());
    }

    pub fn fail_commands_containing(&self, needle: &str) {
        let mut state = self.state.lock().expect("fleet lock");
        state.failing_commands.push(needle.to_string());
    }

    fn shell(&self, state: &mut FleetState, host_name: &str, command: &str) -> HostOutcome {
        state
            .shell_log
            .push((host_name.to_string(), command.to_string()));
        if state
            .failing_commands
            .iter()
            .any(|needle| command.contains(needle.as_str()))
        {
            return HostOutcome::failed(Some(1), "injected failure");
        }
        let Some(host) = state.hosts.get_mut(host_name) else {
            return HostOutcome::unreachable("unknown host");
        };

        if command == self.commands.start {
            host.agent_running = true;
            return HostOutcome::ok("");
        }
        if command == self.commands.stop {
            host.agent_running = false;
            return HostOutcome::ok("");
        }
        if command == self.commands.status {
            return HostOutcome::ok(if host.agent_running { "running" } else { "stopped" });
        }
        if let Some(rest) = command.strip_prefix("ls -1A -- ") {
            let dir = unquote(rest.trim_end_matches(" 2>/dev/null || true"));
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let names = host
                .files
                .keys()
                .filter_map(|path| path.strip_prefix(&prefix))
                .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
                .collect::<BTreeSet<_>>();
            let mut out = names.into_iter().collect::<Vec<_>>().join("\n");
            if !out.is_empty() {
                out.push('\n');
            }
            return HostOutcome::ok(out);
        }
        if let Some(rest) = command.strip_prefix("cat -- ") {
            return match host.files.get(&unquote(rest)) {
                Some(file) => HostOutcome::ok(file.content.clone()),
                None => HostOutcome::failed(Some(1), "No such file or directory"),
            };
        }
        if let Some(rest) = command.strip_prefix("stat -c '%A %U %G %y' -- ") {
            return match host.files.get(&unquote(rest)) {
                Some(file) => HostOutcome::ok(format!(
                    "{} {} {} 2024-05-06 07:08:09.000000000 +0000\n",
                    permissions_of(&file.mode),
                    file.owner,
                    file.group
                )),
                None => HostOutcome::failed(Some(1), "cannot stat"),
            };
        }
        if command.starts_with("echo uid=$(getent passwd ") {
            let lookup = |marker: &str, table: &BTreeMap<String, u32>| {
                command
                    .split(marker)
                    .nth(1)
                    .and_then(|rest| rest.split_whitespace().next())
                    .and_then(|name| table.get(&unquote(name)))
                    .map(u32::to_string)
                    .unwrap_or_default()
            };
            let uid = lookup("getent passwd ", &host.users);
            let gid = lookup("getent group ", &host.groups);
            return HostOutcome::ok(format!("uid={uid}\ngid={gid}\n"));
        }
        HostOutcome::failed(Some(127), format!("unknown command: {command}"))
    }

    fn copy(&self, state: &mut FleetState, host_name: &str, module: &RemoteModule) -> HostOutcome {
        let RemoteModule::Copy {
            src,
            dest,
            mode,
            owner,
            group,
        } = module
        else {
            return HostOutcome::failed(None, "not a copy");
        };
        let Some(host) = state.hosts.get_mut(host_name) else {
            return HostOutcome::unreachable("unknown host");
        };
        let sources = if src.is_dir() {
            let Ok(names) = list_file_names(src) else {
                return HostOutcome::failed(Some(1), "unreadable source dir");
            };
            names
                .into_iter()
                .map(|name| {
                    (
                        src.join(&name),
                        format!("{}/{name}", dest.trim_end_matches('/')),
                    )
                })
                .collect::<Vec<_>>()
        } else {
            vec![(src.clone(), dest.clone())]
        };
        for (local, remote) in sources {
            let Ok(content) = fs::read_to_string(&local) else {
                return HostOutcome::failed(Some(1), format!("cannot read {}", local.display()));
            };
            host.files.insert(
                remote,
                FakeFile {
                    content,
                    mode: mode.clone(),
                    owner: owner.clone(),
                    group: group.clone(),
                },
            );
        }
        HostOutcome::ok("")
    }

    fn fetch(&self, state: &mut FleetState, host_name: &str, src: &str, dest: &Path) -> HostOutcome {
        if state
            .failing_fetches
            .iter()
            .any(|needle| src.contains(needle.as_str()))
        {
            return HostOutcome::failed(Some(1), "injected fetch failure");
        }
        let Some(file) = state
            .hosts
            .get(host_name)
            .and_then(|host| host.files.get(src))
        else {
            return HostOutcome::failed(Some(1), "No such file or directory");
        };
        if let Some(parent) = dest.parent() {
            if fs::create_dir_all(parent).is_err() {
                return HostOutcome::failed(Some(1), "cannot create local dir");
            }
        }
        match fs::write(dest, &file.content) {
            Ok(()) => HostOutcome::ok(""),
            Err(err) => HostOutcome::failed(Some(1), err.to_string()),
        }
    }
}

impl RemoteExecutor for FakeFleet {
    fn run(
        &self,
        hosts: &[String],
        module: &RemoteModule,
    ) -> Result<ExecutionReport, ExecutorError> {
        let mut state = self.state.lock().expect("fleet lock");
        let mut report = ExecutionReport::default();
        for host in hosts {
            if state.unreachable.contains(host) {
                report.insert(host, HostOutcome::unreachable("connection timed out"));
                continue;
            }
            let outcome = match module {
                RemoteModule::Shell { command } => self.shell(&mut state, host, command),
                RemoteModule::Copy { .. } => self.copy(&mut state, host, module),
                RemoteModule::Fetch { src, dest } => self.fetch(&mut state, host, src, dest),
                RemoteModule::FileAbsent { path } => match state.hosts.get_mut(host) {
                    Some(fake) => {
                        let prefix = format!("{}/", path.trim_end_matches('/'));
                        fake.files
                            .retain(|existing, _| existing != path && !existing.starts_with(&prefix));
                        HostOutcome::ok("")
                    }
                    None => HostOutcome::unreachable("unknown host"),
                },
            };
            report.insert(host, outcome);
        }
        Ok(report)
    }
}

pub fn settings_in(root: &Path) -> Settings {
    let yaml = format!(
        r#"
state_root: {root}/state
staging:
  tmp_dir: {root}/tmp
  data_dir: {root}/data
agent:
  root_dir: {AGENT_ROOT}
  owner: {{ name: root, group: root }}
  commands:
    start: /apps/sh/confd.sh start
    stop: /apps/sh/confd.sh stop
    restart: /apps/sh/confd.sh restart
    status: /apps/sh/confd.sh status
key_store:
  endpoint: http://127.0.0.1:2379
object_storage:
  root: {root}/objects
  bucket: confwave
workers:
  max_concurrency: 2
"#,
        root = root.display()
    );
    serde_yaml::from_str(&yaml).expect("test settings")
}

pub fn app_file(items: &[(&str, &str)]) -> ConfigFile {
    ConfigFile {
        name: "app.cfg".to_string(),
        dir: "/etc/web".to_string(),
        mode: "0644".to_string(),
        owner: confwave::config::FileOwner {
            name: "web".to_string(),
            group: "web".to_string(),
        },
        template: "hello {{getv \"/name\"}}\n".to_string(),
        items: items
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    }
}

pub fn update_request(files: Vec<ConfigFile>, hosts: &[&str]) -> UpdateRequest {
    UpdateRequest {
        service_name: "web".to_string(),
        env_name: "prod".to_string(),
        service_version: "1.0".to_string(),
        check_cmd: "/usr/bin/test -f {{.src}}".to_string(),
        reload_cmd: "systemctl reload \"web\"".to_string(),
        files,
        hosts: hosts.iter().map(|host| host.to_string()).collect(),
    }
}

/// Everything an engine test needs, backed by in-memory adapters and a
/// temporary staging/object-storage root.
pub struct Harness {
    pub dir: TempDir,
    pub settings: Settings,
    pub fleet: Arc<FakeFleet>,
    pub keys: Arc<MemoryKeyStore>,
    pub ledger: Arc<MemoryTaskLedger>,
    pub objects: Arc<FsObjectStore>,
    pub engine: Arc<WorkflowEngine>,
}

impl Harness {
    pub fn new(hosts: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings_in(dir.path());
        let fleet = Arc::new(FakeFleet::new(settings.agent.commands.clone(), hosts));
        let keys = Arc::new(MemoryKeyStore::new());
        let ledger = Arc::new(MemoryTaskLedger::new());
        let objects = Arc::new(FsObjectStore::new(settings.object_storage.root.clone()));
        let engine = Arc::new(WorkflowEngine::new(
            settings.clone(),
            ledger.clone(),
            fleet.clone(),
            keys.clone(),
            objects.clone(),
            EventLog::under_state_root(&settings.state_root),
        ));
        Self {
            dir,
            settings,
            fleet,
            keys,
            ledger,
            objects,
            engine,
        }
    }

    pub fn log_text(&self) -> String {
        fs::read_to_string(self.settings.state_root.join("logs/confwave.log")).unwrap_or_default()
    }
}
