use super::executor::{
    shell_quote, ExecutionReport, ExecutorError, HostOutcome, RemoteExecutor, RemoteModule,
};
use crate::config::ExecutorSettings;
use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

/// `ssh` exits with 255 when the connection itself fails.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// [`RemoteExecutor`] that shells out to the OpenSSH client binaries.
pub struct SshExecutor {
    settings: ExecutorSettings,
    upload_counter: AtomicU64,
}

impl SshExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            settings,
            upload_counter: AtomicU64::new(0),
        }
    }

    fn target(&self, host: &str) -> String {
        format!("{}@{}", self.settings.remote_user, host)
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(key) = self.settings.ssh_key.as_ref() {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    fn wrap(&self, command: &str) -> String {
        if self.settings.become_root && self.settings.remote_user != "root" {
            format!("sudo -n sh -c {}", shell_quote(command))
        } else {
            format!("sh -c {}", shell_quote(command))
        }
    }

    fn spawn(&self, binary: &str, args: &[String]) -> Result<Output, ExecutorError> {
        Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ExecutorError::Spawn {
                binary: binary.to_string(),
                source,
            })
    }

    fn ssh_raw(&self, host: &str, command: &str) -> Result<Output, ExecutorError> {
        let mut args = self.common_options();
        args.push(self.target(host));
        args.push(self.wrap(command));
        self.spawn(&self.settings.ssh_binary, &args)
    }

    fn shell(&self, host: &str, command: &str) -> Result<HostOutcome, ExecutorError> {
        let output = self.ssh_raw(host, command)?;
        Ok(outcome_from_output(&output))
    }

    fn fetch(&self, host: &str, src: &str, dest: &Path) -> Result<HostOutcome, ExecutorError> {
        let output = self.ssh_raw(host, &format!("cat -- {}", shell_quote(src)))?;
        if !output.status.success() {
            return Ok(outcome_from_output(&output));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| ExecutorError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        fs::write(dest, &output.stdout).map_err(|source| ExecutorError::Io {
            path: dest.display().to_string(),
            source,
        })?;
        Ok(HostOutcome::ok(""))
    }

    fn install_one(
        &self,
        host: &str,
        src: &Path,
        dest: &str,
        mode: &str,
        owner: &str,
        group: &str,
    ) -> Result<HostOutcome, ExecutorError> {
        let staged = format!(
            "/tmp/.confwave-upload-{}-{}",
            std::process::id(),
            self.upload_counter.fetch_add(1, Ordering::Relaxed)
        );
        let mut args = self.common_options();
        args.push("-q".to_string());
        args.push(src.display().to_string());
        args.push(format!("{}:{}", self.target(host), staged));
        let upload = self.spawn(&self.settings.scp_binary, &args)?;
        if !upload.status.success() {
            return Ok(outcome_from_output(&upload));
        }
        let install = format!(
            "install -D -m {} -o {} -g {} {} {} && rm -f {}",
            shell_quote(mode),
            shell_quote(owner),
            shell_quote(group),
            shell_quote(&staged),
            shell_quote(dest),
            shell_quote(&staged)
        );
        self.shell(host, &install)
    }

    fn copy(
        &self,
        host: &str,
        src: &Path,
        dest: &str,
        mode: &str,
        owner: &str,
        group: &str,
    ) -> Result<HostOutcome, ExecutorError> {
        if !src.is_dir() {
            return self.install_one(host, src, dest, mode, owner, group);
        }
        let mkdir = self.shell(host, &format!("mkdir -p {}", shell_quote(dest)))?;
        if !mkdir.is_ok() {
            return Ok(mkdir);
        }
        let names = crate::shared::fs::list_file_names(src).map_err(|source| {
            ExecutorError::Io {
                path: src.display().to_string(),
                source,
            }
        })?;
        for name in names {
            let target = format!("{}/{}", dest.trim_end_matches('/'), name);
            let outcome = self.install_one(host, &src.join(&name), &target, mode, owner, group)?;
            if !outcome.is_ok() {
                return Ok(outcome);
            }
        }
        Ok(HostOutcome::ok(""))
    }
}

impl RemoteExecutor for SshExecutor {
    fn run(
        &self,
        hosts: &[String],
        module: &RemoteModule,
    ) -> Result<ExecutionReport, ExecutorError> {
        if let RemoteModule::Fetch { .. } = module {
            if hosts.len() > 1 {
                return Err(ExecutorError::InvalidRequest {
                    module: module.name(),
                    reason: "fetch targets exactly one host per call".to_string(),
                });
            }
        }

        let mut report = ExecutionReport::default();
        for host in hosts {
            let outcome = match module {
                RemoteModule::Shell { command } => self.shell(host, command)?,
                RemoteModule::Copy {
                    src,
                    dest,
                    mode,
                    owner,
                    group,
                } => self.copy(host, src, dest, mode, owner, group)?,
                RemoteModule::Fetch { src, dest } => self.fetch(host, src, dest)?,
                RemoteModule::FileAbsent { path } => {
                    self.shell(host, &format!("rm -rf -- {}", shell_quote(path)))?
                }
            };
            report.insert(host.clone(), outcome);
        }
        Ok(report)
    }
}

fn outcome_from_output(output: &Output) -> HostOutcome {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    match output.status.code() {
        Some(0) => HostOutcome::ok(stdout),
        Some(SSH_CONNECTION_FAILURE) => HostOutcome::unreachable(stderr),
        rc => HostOutcome {
            stdout,
            ..HostOutcome::failed(rc, stderr)
        },
    }
}
