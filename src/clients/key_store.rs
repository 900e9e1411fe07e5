use std::collections::BTreeMap;
use std::sync::Mutex;

/// A direct child of a directory node. `value` is `None` for sub-directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChild {
    pub key: String,
    pub value: Option<String>,
}

impl KeyChild {
    /// Last path segment of `key`.
    pub fn leaf_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyNode {
    Leaf(String),
    Dir(Vec<KeyChild>),
}

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key store request for `{path}` failed: {message}")]
    Request { path: String, message: String },
    #[error("key store rejected `{path}`: {message}")]
    Rejected { path: String, message: String },
    #[error("invalid key store response for `{path}`: {message}")]
    Response { path: String, message: String },
    #[error("key store lock poisoned")]
    Poisoned,
}

/// Hierarchical key-value namespace holding live settings.
pub trait KeyStore: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool, KeyStoreError>;

    /// `Ok(None)` when nothing lives at `path`.
    fn read(&self, path: &str) -> Result<Option<KeyNode>, KeyStoreError>;

    fn write(&self, path: &str, value: &str) -> Result<(), KeyStoreError>;

    /// Deleting a directory requires `recursive`.
    fn delete(&self, path: &str, recursive: bool) -> Result<(), KeyStoreError>;
}

/// Normalizes to a leading `/` and no trailing `/`; the root is `/`.
pub fn normalize_key_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    let mut normalized = String::with_capacity(trimmed.len() + 1);
    normalized.push('/');
    let mut first = true;
    for segment in trimmed.split('/').filter(|segment| !segment.is_empty()) {
        if !first {
            normalized.push('/');
        }
        normalized.push_str(segment);
        first = false;
    }
    normalized
}

/// In-process key store; directories exist implicitly through their leaves.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    leaves: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every leaf, keyed by full path.
    pub fn snapshot(&self) -> Result<BTreeMap<String, String>, KeyStoreError> {
        let leaves = self.leaves.lock().map_err(|_| KeyStoreError::Poisoned)?;
        Ok(leaves.clone())
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

impl KeyStore for MemoryKeyStore {
    fn exists(&self, path: &str) -> Result<bool, KeyStoreError> {
        Ok(self.read(path)?.is_some())
    }

    fn read(&self, path: &str) -> Result<Option<KeyNode>, KeyStoreError> {
        let path = normalize_key_path(path);
        let leaves = self.leaves.lock().map_err(|_| KeyStoreError::Poisoned)?;
        if let Some(value) = leaves.get(&path) {
            return Ok(Some(KeyNode::Leaf(value.clone())));
        }

        let prefix = child_prefix(&path);
        let mut children: BTreeMap<String, Option<String>> = BTreeMap::new();
        for (key, value) in leaves.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                None => {
                    children.insert(key.clone(), Some(value.clone()));
                }
                Some((segment, _)) => {
                    children
                        .entry(format!("{prefix}{segment}"))
                        .or_insert(None);
                }
            }
        }
        if children.is_empty() && path != "/" {
            return Ok(None);
        }
        Ok(Some(KeyNode::Dir(
            children
                .into_iter()
                .map(|(key, value)| KeyChild { key, value })
                .collect(),
        )))
    }

    fn write(&self, path: &str, value: &str) -> Result<(), KeyStoreError> {
        let path = normalize_key_path(path);
        if path == "/" {
            return Err(KeyStoreError::Rejected {
                path,
                message: "cannot write a value at the root".to_string(),
            });
        }
        let mut leaves = self.leaves.lock().map_err(|_| KeyStoreError::Poisoned)?;
        let prefix = child_prefix(&path);
        if leaves.keys().any(|key| key.starts_with(&prefix)) {
            return Err(KeyStoreError::Rejected {
                path,
                message: "not a file".to_string(),
            });
        }
        leaves.insert(path, value.to_string());
        Ok(())
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), KeyStoreError> {
        let path = normalize_key_path(path);
        let mut leaves = self.leaves.lock().map_err(|_| KeyStoreError::Poisoned)?;
        if leaves.remove(&path).is_some() {
            return Ok(());
        }
        let prefix = child_prefix(&path);
        let nested = leaves
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect::<Vec<_>>();
        if nested.is_empty() {
            return Err(KeyStoreError::Rejected {
                path,
                message: "key not found".to_string(),
            });
        }
        if !recursive {
            return Err(KeyStoreError::Rejected {
                path,
                message: "directory delete requires recursive".to_string(),
            });
        }
        for key in nested {
            leaves.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_slashes() {
        assert_eq!(normalize_key_path("a//b/"), "/a/b");
        assert_eq!(normalize_key_path("/"), "/");
        assert_eq!(normalize_key_path(""), "/");
    }

    #[test]
    fn directories_list_direct_children_only() {
        let store = MemoryKeyStore::new();
        store.write("/prod/web/app.cfg/name", "world").expect("write");
        store.write("/prod/web/app.cfg/nested/deep", "x").expect("write");

        let node = store.read("/prod/web/app.cfg").expect("read").expect("node");
        let KeyNode::Dir(children) = node else {
            panic!("expected directory");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].leaf_name(), "name");
        assert_eq!(children[0].value.as_deref(), Some("world"));
        assert_eq!(children[1].leaf_name(), "nested");
        assert_eq!(children[1].value, None);
        assert!(store.read("/missing").expect("read").is_none());
    }

    #[test]
    fn directory_delete_requires_recursive() {
        let store = MemoryKeyStore::new();
        store.write("/bak/web/a", "1").expect("write");
        assert!(store.delete("/bak", false).is_err());
        store.delete("/bak", true).expect("recursive delete");
        assert!(!store.exists("/bak/web/a").expect("exists"));
    }
}
