use super::object_store::{ObjectStore, ObjectStoreError};
use crate::shared::fs::{atomic_write_file, list_file_names};
use std::fs;
use std::path::{Path, PathBuf};

/// Object store backed by a directory per bucket under `root`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, ObjectStoreError> {
        if bucket.is_empty() || bucket.contains('/') || bucket == "." || bucket == ".." {
            return Err(ObjectStoreError::InvalidName {
                name: bucket.to_string(),
            });
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, name: &str) -> Result<PathBuf, ObjectStoreError> {
        let valid = !name.is_empty()
            && name
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
        if !valid {
            return Err(ObjectStoreError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.bucket_dir(bucket)?.join(name))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl ObjectStore for FsObjectStore {
    fn ensure_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        let dir = self.bucket_dir(bucket)?;
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let (dir_part, name_prefix) = match prefix.rsplit_once('/') {
            Some((dir, rest)) => (dir, rest),
            None => ("", prefix),
        };
        let bucket_dir = self.bucket_dir(bucket)?;
        let dir = if dir_part.is_empty() {
            bucket_dir
        } else {
            bucket_dir.join(dir_part)
        };
        let names = list_file_names(&dir).map_err(|e| io_error(&dir, e))?;
        Ok(names
            .into_iter()
            .filter(|name| name.starts_with(name_prefix))
            .map(|name| {
                if dir_part.is_empty() {
                    name
                } else {
                    format!("{dir_part}/{name}")
                }
            })
            .collect())
    }

    fn remove_object(&self, bucket: &str, name: &str) -> Result<(), ObjectStoreError> {
        let path = self.object_path(bucket, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    fn upload(
        &self,
        bucket: &str,
        local_path: &Path,
        name: &str,
    ) -> Result<(), ObjectStoreError> {
        let target = self.object_path(bucket, name)?;
        let body = fs::read(local_path).map_err(|e| io_error(local_path, e))?;
        atomic_write_file(&target, &body).map_err(|e| io_error(&target, e))
    }

    fn download(
        &self,
        bucket: &str,
        name: &str,
        local_path: &Path,
    ) -> Result<(), ObjectStoreError> {
        let source = self.object_path(bucket, name)?;
        let body = match fs::read(&source) {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    name: name.to_string(),
                })
            }
            Err(err) => return Err(io_error(&source, err)),
        };
        atomic_write_file(local_path, &body).map_err(|e| io_error(local_path, e))
    }
}
