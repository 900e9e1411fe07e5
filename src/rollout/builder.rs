use crate::rollout::agent::{AgentController, OwnerIds};
use crate::rollout::error::RolloutError;
use crate::rollout::layout::RolloutLayout;
use crate::rollout::request::{ConfigFile, UpdateRequest};
use crate::shared::fs::{atomic_write_file, ensure_dir};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Agent metadata for one destination file on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub prefix: String,
    pub keys: Vec<String>,
    pub src: String,
    pub dest: String,
    pub ids: OwnerIds,
    pub mode: String,
    pub check_cmd: String,
    pub reload_cmd: String,
}

impl Descriptor {
    pub fn for_file(
        layout: &RolloutLayout,
        request: &UpdateRequest,
        file: &ConfigFile,
        ids: OwnerIds,
    ) -> Self {
        Self {
            prefix: layout.key_prefix(&file.name),
            keys: file.items.keys().cloned().collect(),
            src: layout.template_src(&file.name),
            dest: file.dest_path(),
            ids,
            mode: file.mode.clone(),
            check_cmd: request.check_cmd.clone(),
            reload_cmd: request.reload_cmd.clone(),
        }
    }

    /// Renders the `[template]` table the agent reads.
    pub fn render(&self) -> String {
        let keys = self
            .keys
            .iter()
            .map(|key| quote(key))
            .collect::<Vec<_>>()
            .join(", ");
        let mut out = String::from("[template]\n");
        out.push_str(&format!("prefix = {}\n", quote(&self.prefix)));
        out.push_str(&format!("keys = [{keys}]\n"));
        out.push_str(&format!("src = {}\n", quote(&self.src)));
        out.push_str(&format!("dest = {}\n", quote(&self.dest)));
        out.push_str(&format!("uid = {}\n", self.ids.uid));
        out.push_str(&format!("gid = {}\n", self.ids.gid));
        out.push_str(&format!("mode = {}\n", quote(&self.mode)));
        out.push_str(&format!(
            "check_cmd = {}\n",
            quote(&self.check_cmd.replace('"', "'"))
        ));
        out.push_str(&format!(
            "reload_cmd = {}\n",
            quote(&self.reload_cmd.replace('"', "'"))
        ));
        out
    }
}

fn quote(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Writes each template body to local staging. Returns config name -> path.
pub fn create_templates(
    layout: &RolloutLayout,
    files: &[ConfigFile],
) -> Result<BTreeMap<String, PathBuf>, RolloutError> {
    let dir = layout.staging_template_dir();
    ensure_dir(&dir).map_err(|e| RolloutError::io(&dir, e))?;
    let mut created = BTreeMap::new();
    for file in files {
        let path = dir.join(layout.template_file_name(&file.name));
        atomic_write_file(&path, file.template.as_bytes()).map_err(|e| RolloutError::io(&path, e))?;
        created.insert(file.name.clone(), path);
    }
    Ok(created)
}

/// Writes one descriptor per (file, host). Owner ids are resolved per host.
/// Returns config name -> host -> path.
pub fn create_descriptors(
    layout: &RolloutLayout,
    agent: &AgentController,
    request: &UpdateRequest,
) -> Result<BTreeMap<String, BTreeMap<String, PathBuf>>, RolloutError> {
    for host in &request.hosts {
        let dir = layout.staging_descriptor_dir(host);
        ensure_dir(&dir).map_err(|e| RolloutError::io(&dir, e))?;
    }
    let mut created = BTreeMap::new();
    for file in &request.files {
        let ids = agent.resolve_owner_ids(&request.hosts, &file.owner)?;
        let mut per_host = BTreeMap::new();
        for host in &request.hosts {
            let Some(host_ids) = ids.get(host).copied() else {
                return Err(RolloutError::RemoteOutput {
                    host: host.clone(),
                    action: "resolving owner ids",
                    reason: format!("no ids reported for `{}`", file.owner),
                });
            };
            let descriptor = Descriptor::for_file(layout, request, file, host_ids);
            let path = layout
                .staging_descriptor_dir(host)
                .join(layout.descriptor_file_name(&file.name));
            atomic_write_file(&path, descriptor.render().as_bytes())
                .map_err(|e| RolloutError::io(&path, e))?;
            per_host.insert(host.clone(), path);
        }
        created.insert(file.name.clone(), per_host);
    }
    Ok(created)
}
