use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid object name `{name}`")]
    InvalidName { name: String },
    #[error("object `{name}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, name: String },
}

/// Bucketed blob storage addressed by `/`-separated object names.
pub trait ObjectStore: Send + Sync {
    /// Creates `bucket` when missing. Idempotent.
    fn ensure_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError>;

    /// Full names of the objects directly under `prefix`, sorted. Deeper
    /// levels are not descended into.
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    fn remove_object(&self, bucket: &str, name: &str) -> Result<(), ObjectStoreError>;

    fn upload(&self, bucket: &str, local_path: &Path, name: &str)
        -> Result<(), ObjectStoreError>;

    fn download(&self, bucket: &str, name: &str, local_path: &Path)
        -> Result<(), ObjectStoreError>;
}

/// Last `/`-separated segment of an object name.
pub fn object_base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
