use crate::config::Settings;
use crate::rollout::request::{ConfigFile, Coordinate};
use crate::shared::fs::remove_dir_if_exists;
use std::path::PathBuf;

/// Snapshot artifact classes kept in object storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactClass {
    Descriptor,
    Template,
    RawFile,
}

impl ArtifactClass {
    pub const ALL: [ArtifactClass; 3] = [
        ArtifactClass::Descriptor,
        ArtifactClass::Template,
        ArtifactClass::RawFile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Descriptor => "descriptor",
            Self::Template => "template",
            Self::RawFile => "rawfile",
        }
    }
}

impl std::fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const DESCRIPTOR_SUFFIX: &str = ".toml";
const TEMPLATE_SUFFIX: &str = ".tmpl";

/// Every local, remote, object-storage and key-space path one coordinate
/// touches. All names are derived deterministically from the coordinate.
#[derive(Debug, Clone)]
pub struct RolloutLayout {
    coordinate: Coordinate,
    tmp_dir: PathBuf,
    data_dir: PathBuf,
    remote_descriptor_dir: String,
    remote_template_root: String,
    backup_key_prefix: String,
}

impl RolloutLayout {
    pub fn new(coordinate: Coordinate, settings: &Settings) -> Self {
        Self {
            coordinate,
            tmp_dir: settings.staging.tmp_dir.clone(),
            data_dir: settings.staging.data_dir.clone(),
            remote_descriptor_dir: settings.agent.descriptor_dir(),
            remote_template_root: settings.agent.template_dir(),
            backup_key_prefix: settings.key_store.backup_prefix.trim_matches('/').to_string(),
        }
    }

    pub fn coordinate(&self) -> &Coordinate {
        &self.coordinate
    }

    pub fn staging_descriptor_root(&self) -> PathBuf {
        self.tmp_dir.join("conf.d").join(self.coordinate.folder())
    }

    /// Freshly built descriptors for `host`.
    pub fn staging_descriptor_dir(&self, host: &str) -> PathBuf {
        self.staging_descriptor_root().join(host)
    }

    /// Freshly built templates; shared by every host.
    pub fn staging_template_dir(&self) -> PathBuf {
        self.tmp_dir.join("templates").join(self.coordinate.folder())
    }

    /// Local mirror of one snapshot class for `host`.
    pub fn backup_dir(&self, class: ArtifactClass, host: &str) -> PathBuf {
        self.data_dir
            .join("backup")
            .join(class.as_str())
            .join(self.coordinate.folder())
            .join(host)
    }

    /// Object-name prefix of one snapshot class for `host`, with trailing `/`.
    pub fn object_prefix(&self, class: ArtifactClass, host: &str) -> String {
        format!("{}/{}/{}/", class.as_str(), self.coordinate.folder(), host)
    }

    pub fn remote_descriptor_dir(&self) -> &str {
        &self.remote_descriptor_dir
    }

    pub fn remote_template_dir(&self) -> String {
        format!("{}/{}", self.remote_template_root, self.coordinate.folder())
    }

    pub fn descriptor_file_name(&self, config_name: &str) -> String {
        format!(
            "{}.{config_name}{DESCRIPTOR_SUFFIX}",
            self.coordinate.file_pre()
        )
    }

    pub fn template_file_name(&self, config_name: &str) -> String {
        format!("{config_name}{TEMPLATE_SUFFIX}")
    }

    /// Template reference written into a descriptor, relative to the
    /// agent's template root.
    pub fn template_src(&self, config_name: &str) -> String {
        format!("{}/{config_name}{TEMPLATE_SUFFIX}", self.coordinate.folder())
    }

    /// Whether a file in the agent's descriptor directory belongs to this
    /// coordinate.
    pub fn owns_descriptor(&self, file_name: &str) -> bool {
        self.config_name_of_descriptor(file_name).is_some()
    }

    /// Logical config name encoded in a descriptor file name.
    pub fn config_name_of_descriptor<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        let file_pre = self.coordinate.file_pre();
        file_name
            .strip_prefix(file_pre.as_str())?
            .strip_prefix('.')?
            .strip_suffix(DESCRIPTOR_SUFFIX)
            .filter(|name| !name.is_empty())
    }

    pub fn config_name_of_template<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        file_name
            .strip_suffix(TEMPLATE_SUFFIX)
            .filter(|name| !name.is_empty())
    }

    /// `/{folder}/{file}` in the live key space.
    pub fn key_prefix(&self, config_name: &str) -> String {
        format!("/{}/{config_name}", self.coordinate.folder())
    }

    /// `/{backup}/{folder}` holding every pre-update key snapshot.
    pub fn backup_key_root(&self) -> String {
        format!("/{}/{}", self.backup_key_prefix, self.coordinate.folder())
    }

    pub fn backup_key_prefix(&self, config_name: &str) -> String {
        format!("{}/{config_name}", self.backup_key_root())
    }

    pub fn live_key(&self, file: &ConfigFile, key: &str) -> String {
        format!("{}/{key}", self.key_prefix(&file.name))
    }

    pub fn backup_key(&self, file: &ConfigFile, key: &str) -> String {
        format!("{}/{key}", self.backup_key_prefix(&file.name))
    }

    /// Guard removing the freshly built staging directories when dropped.
    pub fn staging_cleanup(&self) -> StagingCleanup {
        StagingCleanup {
            dirs: vec![
                self.staging_descriptor_root(),
                self.staging_template_dir(),
            ],
        }
    }
}

/// Removes a run's local build output on drop.
#[derive(Debug)]
pub struct StagingCleanup {
    dirs: Vec<PathBuf>,
}

impl Drop for StagingCleanup {
    fn drop(&mut self) {
        for dir in &self.dirs {
            let _ = remove_dir_if_exists(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RolloutLayout {
        let settings: Settings = serde_yaml::from_str(
            r#"
state_root: /srv/cw
staging: { tmp_dir: /srv/cw/tmp, data_dir: /srv/cw/data }
agent:
  root_dir: /apps/confd/
  owner: { name: root, group: root }
  commands: { start: s, stop: t, restart: r, status: q }
key_store: { endpoint: "http://127.0.0.1:2379" }
object_storage: { root: /srv/cw/objects, bucket: confwave }
"#,
        )
        .expect("settings");
        RolloutLayout::new(Coordinate::new("web", "prod", "1.0"), &settings)
    }

    #[test]
    fn descriptor_names_decode_back_to_config_names() {
        let layout = layout();
        let name = layout.descriptor_file_name("app.cfg");
        assert_eq!(name, "prod.web.1.0.app.cfg.toml");
        assert_eq!(layout.config_name_of_descriptor(&name), Some("app.cfg"));
        assert_eq!(layout.config_name_of_descriptor("prod.web.1.1.app.cfg.toml"), None);
        assert_eq!(layout.config_name_of_descriptor("prod.web.1.0.toml"), None);
    }

    #[test]
    fn paths_are_keyed_by_coordinate_and_host() {
        let layout = layout();
        assert_eq!(
            layout.staging_descriptor_dir("10.0.0.1"),
            PathBuf::from("/srv/cw/tmp/conf.d/prod/web/1.0/10.0.0.1")
        );
        assert_eq!(
            layout.object_prefix(ArtifactClass::RawFile, "10.0.0.1"),
            "rawfile/prod/web/1.0/10.0.0.1/"
        );
        assert_eq!(layout.remote_template_dir(), "/apps/confd/templates/prod/web/1.0");
        assert_eq!(layout.key_prefix("app.cfg"), "/prod/web/1.0/app.cfg");
        assert_eq!(layout.backup_key_prefix("app.cfg"), "/bak/prod/web/1.0/app.cfg");
    }
}
