use crate::clients::object_store::object_base_name;
use crate::clients::ObjectStore;
use crate::rollout::agent::AgentController;
use crate::rollout::error::RolloutError;
use crate::rollout::layout::{ArtifactClass, RolloutLayout};
use crate::rollout::rawfile::RawFileName;
use crate::rollout::request::ConfigFile;
use crate::shared::fs::{list_file_names, reset_dir};
use crate::shared::EventLog;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// What one host's snapshot holds after `backup_files`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostSnapshot {
    pub descriptors: Vec<String>,
    pub templates: Vec<String>,
    pub raw_files: Vec<String>,
}

/// Snapshots and restores the agent's files for one coordinate.
pub struct BackupManager<'a> {
    layout: &'a RolloutLayout,
    agent: &'a AgentController,
    objects: &'a dyn ObjectStore,
    bucket: &'a str,
    log: &'a EventLog,
}

impl<'a> BackupManager<'a> {
    pub fn new(
        layout: &'a RolloutLayout,
        agent: &'a AgentController,
        objects: &'a dyn ObjectStore,
        bucket: &'a str,
        log: &'a EventLog,
    ) -> Self {
        Self {
            layout,
            agent,
            objects,
            bucket,
            log,
        }
    }

    /// Descriptor files of this coordinate deployed on `host`.
    pub fn deployed_descriptors(&self, host: &str) -> Result<Vec<String>, RolloutError> {
        Ok(self
            .agent
            .list_dir(host, self.layout.remote_descriptor_dir())?
            .into_iter()
            .filter(|name| self.layout.owns_descriptor(name))
            .collect())
    }

    pub fn deployed_templates(&self, host: &str) -> Result<Vec<String>, RolloutError> {
        Ok(self
            .agent
            .list_dir(host, &self.layout.remote_template_dir())?
            .into_iter()
            .filter(|name| self.layout.config_name_of_template(name).is_some())
            .collect())
    }

    fn reset_local(&self, host: &str) -> Result<(), RolloutError> {
        for class in ArtifactClass::ALL {
            let dir = self.layout.backup_dir(class, host);
            reset_dir(&dir).map_err(|e| RolloutError::io(&dir, e))?;
        }
        Ok(())
    }

    fn clear_snapshot(&self, host: &str) -> Result<(), RolloutError> {
        for class in ArtifactClass::ALL {
            let prefix = self.layout.object_prefix(class, host);
            for name in self.objects.list_objects(self.bucket, &prefix)? {
                self.objects.remove_object(self.bucket, &name)?;
            }
        }
        Ok(())
    }

    fn fetch_and_upload(
        &self,
        host: &str,
        class: ArtifactClass,
        remote_path: &str,
        file_name: &str,
    ) -> Result<bool, RolloutError> {
        let local = self.layout.backup_dir(class, host).join(file_name);
        if !self.agent.fetch(host, remote_path, &local)? {
            return Ok(false);
        }
        let object = format!("{}{file_name}", self.layout.object_prefix(class, host));
        self.objects.upload(self.bucket, &local, &object)?;
        Ok(true)
    }

    fn verify(
        &self,
        host: &str,
        class: ArtifactClass,
        expected: &[String],
    ) -> Result<(), RolloutError> {
        let prefix = self.layout.object_prefix(class, host);
        let stored = self
            .objects
            .list_objects(self.bucket, &prefix)?
            .iter()
            .map(|name| object_base_name(name).to_string())
            .collect::<BTreeSet<_>>();
        let expected = expected.iter().cloned().collect::<BTreeSet<_>>();
        let missing = expected.difference(&stored).cloned().collect::<Vec<_>>();
        let unexpected = stored.difference(&expected).cloned().collect::<Vec<_>>();
        if missing.is_empty() && unexpected.is_empty() {
            return Ok(());
        }
        Err(RolloutError::BackupIntegrity {
            host: host.to_string(),
            class,
            missing,
            unexpected,
        })
    }

    /// Replaces each host's snapshot with what is deployed right now, then
    /// verifies the stored descriptor/template sets match the deployed sets.
    pub fn backup_files(
        &self,
        hosts: &[String],
        files: &[ConfigFile],
    ) -> Result<BTreeMap<String, HostSnapshot>, RolloutError> {
        self.objects.ensure_bucket(self.bucket)?;
        let mut snapshots = BTreeMap::new();
        for host in hosts {
            self.reset_local(host)?;
            self.clear_snapshot(host)?;

            let descriptors = self.deployed_descriptors(host)?;
            for name in &descriptors {
                let remote = format!("{}/{name}", self.layout.remote_descriptor_dir());
                self.fetch_and_upload(host, ArtifactClass::Descriptor, &remote, name)?;
            }

            let template_dir = self.layout.remote_template_dir();
            let templates = self.deployed_templates(host)?;
            for name in &templates {
                let remote = format!("{template_dir}/{name}");
                self.fetch_and_upload(host, ArtifactClass::Template, &remote, name)?;
            }

            let mut raw_files = Vec::new();
            for file in files {
                let encoded = RawFileName::for_file(file).encode();
                if self.fetch_and_upload(host, ArtifactClass::RawFile, &file.dest_path(), &encoded)? {
                    raw_files.push(file.dest_path());
                }
            }

            self.verify(host, ArtifactClass::Descriptor, &descriptors)?;
            self.verify(host, ArtifactClass::Template, &templates)?;
            self.log.info(
                "backup.snapshot",
                &format!(
                    "{} on {host}: {} descriptors, {} templates, {} raw files",
                    self.layout.coordinate(),
                    descriptors.len(),
                    templates.len(),
                    raw_files.len()
                ),
            );
            snapshots.insert(
                host.clone(),
                HostSnapshot {
                    descriptors,
                    templates,
                    raw_files,
                },
            );
        }
        Ok(snapshots)
    }

    /// Removes every descriptor and template of this coordinate from the
    /// agent's directories.
    pub fn delete_files(&self, hosts: &[String]) -> Result<BTreeMap<String, Vec<String>>, RolloutError> {
        let mut removed = BTreeMap::new();
        for host in hosts {
            let descriptors = self.deployed_descriptors(host)?;
            for name in &descriptors {
                self.agent.remove(
                    host,
                    &format!("{}/{name}", self.layout.remote_descriptor_dir()),
                )?;
            }
            self.agent.remove(host, &self.layout.remote_template_dir())?;
            removed.insert(host.clone(), descriptors);
        }
        Ok(removed)
    }

    /// Removes descriptors and templates whose config name is no longer part
    /// of `files`; retained names are left untouched.
    pub fn delete_expired_files(
        &self,
        hosts: &[String],
        files: &[ConfigFile],
    ) -> Result<BTreeMap<String, Vec<String>>, RolloutError> {
        let current = files
            .iter()
            .map(|file| file.name.as_str())
            .collect::<BTreeSet<_>>();
        let template_dir = self.layout.remote_template_dir();
        let mut removed = BTreeMap::new();
        for host in hosts {
            let mut expired = Vec::new();
            for name in self.deployed_descriptors(host)? {
                let keep = self
                    .layout
                    .config_name_of_descriptor(&name)
                    .is_some_and(|config| current.contains(config));
                if !keep {
                    let path = format!("{}/{name}", self.layout.remote_descriptor_dir());
                    self.agent.remove(host, &path)?;
                    expired.push(path);
                }
            }
            for name in self.deployed_templates(host)? {
                let keep = self
                    .layout
                    .config_name_of_template(&name)
                    .is_some_and(|config| current.contains(config));
                if !keep {
                    let path = format!("{template_dir}/{name}");
                    self.agent.remove(host, &path)?;
                    expired.push(path);
                }
            }
            if !expired.is_empty() {
                self.log.info(
                    "backup.expired_removed",
                    &format!("removed {} expired files on {host}", expired.len()),
                );
            }
            removed.insert(host.clone(), expired);
        }
        Ok(removed)
    }

    /// Installs descriptors and templates on every host: the fresh build, or
    /// with `rollback` the stored snapshot, raw files included.
    pub fn push_files(&self, hosts: &[String], rollback: bool) -> Result<(), RolloutError> {
        let template_dir = self.layout.remote_template_dir();
        for host in hosts {
            if rollback {
                self.restore_snapshot(host)?;
                self.agent.push_dir(
                    host,
                    &self.layout.backup_dir(ArtifactClass::Descriptor, host),
                    self.layout.remote_descriptor_dir(),
                )?;
                self.agent.push_dir(
                    host,
                    &self.layout.backup_dir(ArtifactClass::Template, host),
                    &template_dir,
                )?;
            } else {
                self.agent.push_dir(
                    host,
                    &self.layout.staging_descriptor_dir(host),
                    self.layout.remote_descriptor_dir(),
                )?;
                self.agent
                    .push_dir(host, &self.layout.staging_template_dir(), &template_dir)?;
            }
        }
        Ok(())
    }

    /// Repopulates local staging from object storage and restores raw files
    /// on `host` with their recorded mode and owner.
    fn restore_snapshot(&self, host: &str) -> Result<(), RolloutError> {
        self.reset_local(host)?;
        for class in ArtifactClass::ALL {
            let dir = self.layout.backup_dir(class, host);
            let prefix = self.layout.object_prefix(class, host);
            for object in self.objects.list_objects(self.bucket, &prefix)? {
                let local = dir.join(object_base_name(&object));
                self.objects.download(self.bucket, &object, &local)?;
            }
        }

        let raw_dir = self.layout.backup_dir(ArtifactClass::RawFile, host);
        let mut restored = 0_usize;
        for encoded in list_file_names(&raw_dir).map_err(|e| RolloutError::io(&raw_dir, e))? {
            self.restore_raw_file(host, &raw_dir, &encoded)?;
            restored += 1;
        }
        self.log.info(
            "backup.restored",
            &format!("{} on {host}: restored {restored} raw files", self.layout.coordinate()),
        );
        Ok(())
    }

    fn restore_raw_file(&self, host: &str, raw_dir: &Path, encoded: &str) -> Result<(), RolloutError> {
        let meta = RawFileName::decode(encoded).map_err(|reason| RolloutError::CorruptSnapshot {
            name: encoded.to_string(),
            reason,
        })?;
        self.agent
            .install_file(host, &raw_dir.join(encoded), &meta.path, &meta.mode, &meta.owner)
    }
}
