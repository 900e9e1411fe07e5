use crate::clients::{KeyNode, KeyStore};
use crate::rollout::error::RolloutError;
use crate::rollout::layout::RolloutLayout;
use crate::rollout::request::ConfigFile;
use crate::shared::EventLog;
use std::collections::BTreeMap;

/// Keeps the live key space of one coordinate in step with its files, with
/// a backup subtree holding the pre-update values.
pub struct KeySynchronizer<'a> {
    layout: &'a RolloutLayout,
    store: &'a dyn KeyStore,
    log: &'a EventLog,
}

impl<'a> KeySynchronizer<'a> {
    pub fn new(layout: &'a RolloutLayout, store: &'a dyn KeyStore, log: &'a EventLog) -> Self {
        Self { layout, store, log }
    }

    /// Leaf name -> value directly under the live (or backup) path of
    /// `config_name`. Missing paths read as empty.
    pub fn get_keys(
        &self,
        config_name: &str,
        backup: bool,
    ) -> Result<BTreeMap<String, String>, RolloutError> {
        let path = if backup {
            self.layout.backup_key_prefix(config_name)
        } else {
            self.layout.key_prefix(config_name)
        };
        let Some(KeyNode::Dir(children)) = self.store.read(&path)? else {
            return Ok(BTreeMap::new());
        };
        Ok(children
            .into_iter()
            .filter_map(|child| {
                let name = child.leaf_name().to_string();
                child.value.map(|value| (name, value))
            })
            .collect())
    }

    /// Replaces the backup subtree with the current live leaves of `files`.
    pub fn backup_keys(&self, files: &[ConfigFile]) -> Result<usize, RolloutError> {
        let root = self.layout.backup_key_root();
        if self.store.exists(&root)? {
            self.store.delete(&root, true)?;
        }
        let mut copied = 0;
        for file in files {
            for (key, value) in self.get_keys(&file.name, false)? {
                self.store.write(&self.layout.backup_key(file, &key), &value)?;
                copied += 1;
            }
        }
        self.log.info(
            "keys.backup",
            &format!("{}: copied {copied} keys to {root}", self.layout.coordinate()),
        );
        Ok(copied)
    }

    /// Writes the submitted items, or with `rollback` the backed-up items.
    /// Keys the submitted items introduced that the restore source lacks are
    /// deleted first.
    pub fn update_keys(
        &self,
        files: &[ConfigFile],
        rollback: bool,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, RolloutError> {
        let mut written = BTreeMap::new();
        for file in files {
            let restore = if rollback {
                self.get_keys(&file.name, true)?
            } else {
                file.items.clone()
            };
            for key in file.items.keys().filter(|key| !restore.contains_key(*key)) {
                let path = self.layout.live_key(file, key);
                if self.store.exists(&path)? {
                    self.store.delete(&path, false)?;
                    self.log.info("keys.deleted", &path);
                }
            }
            for (key, value) in &restore {
                self.store.write(&self.layout.live_key(file, key), value)?;
            }
            written.insert(file.name.clone(), restore);
        }
        Ok(written)
    }

    /// Deletes live leaves absent from each file's current items.
    pub fn delete_expired_keys(
        &self,
        files: &[ConfigFile],
    ) -> Result<BTreeMap<String, Vec<String>>, RolloutError> {
        let mut deleted = BTreeMap::new();
        for file in files {
            let mut expired = Vec::new();
            for key in self.get_keys(&file.name, false)?.into_keys() {
                if file.items.contains_key(&key) {
                    continue;
                }
                let path = self.layout.live_key(file, &key);
                self.store.delete(&path, false)?;
                self.log.info("keys.deleted", &path);
                expired.push(key);
            }
            deleted.insert(file.name.clone(), expired);
        }
        Ok(deleted)
    }
}
