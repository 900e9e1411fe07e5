//! File-name codec for raw-file snapshots. The object name carries the file's
//! mode, owner and absolute path so a restore needs nothing else:
//!
//! `{mode}@@{owner}@@{group}~sep~{path with "/" replaced by "~sl~"}`

use crate::config::FileOwner;
use crate::rollout::request::ConfigFile;

pub const FIELD_SEPARATOR: &str = "@@";
pub const PATH_SEPARATOR: &str = "~sep~";
pub const SLASH_MARKER: &str = "~sl~";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileName {
    pub mode: String,
    pub owner: FileOwner,
    pub path: String,
}

impl RawFileName {
    pub fn for_file(file: &ConfigFile) -> Self {
        Self {
            mode: file.mode.clone(),
            owner: file.owner.clone(),
            path: file.dest_path(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}{PATH_SEPARATOR}{}",
            self.mode,
            self.owner.name,
            self.owner.group,
            self.path.replace('/', SLASH_MARKER)
        )
    }

    pub fn decode(encoded: &str) -> Result<Self, String> {
        let (meta, path) = encoded
            .split_once(PATH_SEPARATOR)
            .ok_or_else(|| format!("raw file name `{encoded}` lacks `{PATH_SEPARATOR}`"))?;
        let fields = meta.split(FIELD_SEPARATOR).collect::<Vec<_>>();
        let [mode, name, group] = fields.as_slice() else {
            return Err(format!(
                "raw file name `{encoded}` must carry mode, owner and group"
            ));
        };
        let path = path.replace(SLASH_MARKER, "/");
        if !path.starts_with('/') {
            return Err(format!(
                "raw file name `{encoded}` does not encode an absolute path"
            ));
        }
        Ok(Self {
            mode: (*mode).to_string(),
            owner: FileOwner {
                name: (*name).to_string(),
                group: (*group).to_string(),
            },
            path,
        })
    }
}
