//! The storage backend holding the workspace.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt::Debug;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod local;

pub use local::LocalStorage;

/// Remote object stores that a storage URI may name but that this SDK cannot write to.
const REMOTE_SCHEMES: &[&str] = &["s3://", "gs://", "gcs://", "abfs://"];

/// File operations needed by workspace resources.
///
/// All paths are absolute paths within the backend.
pub trait Storage: Debug + Send + Sync {
    /// A short name for this kind of backend.
    fn name(&self) -> &'static str;

    /// The root of this backend.
    fn root(&self) -> &Path;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;

    /// Create a directory and all missing parents. Existing directories are not an error.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Create a single directory, failing with [`std::io::ErrorKind::AlreadyExists`] if it is
    /// already present.
    ///
    /// Only one of several concurrent callers for the same path succeeds, which makes this usable
    /// to reserve a name.
    fn create_dir(&self, path: &Path) -> Result<()>;

    /// The entries directly inside `path`, sorted.
    fn list(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Every file below `path`, recursively, sorted.
    fn find(&self, path: &Path) -> Result<Vec<PathBuf>>;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Open a file for streaming reads.
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>>;

    /// Replace the contents of `path`.
    ///
    /// Readers never observe a partially written file.
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Append to `path`, creating it if needed.
    fn append(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Remove a file. Missing files are not an error.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Remove a directory tree. Missing directories are not an error.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    fn copy_file(&self, src: &Path, dest: &Path) -> Result<()>;

    /// Recursively copy a directory tree within this backend.
    fn copy_dir(&self, src: &Path, dest: &Path) -> Result<()>;

    /// Copy a file or directory from the local filesystem into this backend, replacing anything
    /// already at `dest`.
    fn copy_in(&self, src: &Path, dest: &Path) -> Result<()>;
}

/// Open the backend named by `uri`, or a local backend rooted at `home` when `uri` is blank.
pub fn open(uri: Option<&str>, home: &Path) -> Result<Arc<dyn Storage>> {
    let uri = uri.map(str::trim).filter(|uri| !uri.is_empty());
    let root = match uri {
        None => home.to_path_buf(),
        Some(uri) if REMOTE_SCHEMES.iter().any(|scheme| uri.starts_with(scheme)) => {
            return Err(Error::UnsupportedStorage(uri.into()));
        }
        Some(uri) => match uri.strip_prefix("file://") {
            Some(path) => PathBuf::from(path),
            None if uri.contains("://") => return Err(Error::UnsupportedStorage(uri.into())),
            None => PathBuf::from(uri),
        },
    };
    Ok(Arc::new(LocalStorage::new(root)))
}

/// A description of the storage configuration, for diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct DebugInfo {
    pub storage_uri: Option<String>,
    pub aws_profile: Option<String>,
    pub root_uri: PathBuf,
    pub filesystem_type: &'static str,
}

impl DebugInfo {
    pub fn new(storage: &dyn Storage, storage_uri: Option<&str>) -> Self {
        Self {
            storage_uri: storage_uri.map(String::from),
            aws_profile: std::env::var("AWS_PROFILE").ok(),
            root_uri: storage.root().to_path_buf(),
            filesystem_type: storage.name(),
        }
    }
}

/// Read and parse a JSON document.
pub(crate) fn read_json<T: serde::de::DeserializeOwned>(
    storage: &dyn Storage,
    path: &Path,
) -> Result<T> {
    let bytes = storage.read(path)?;
    serde_json::from_slice(&bytes).map_err(|err| Error::json(path, err))
}

/// Serialize and write a JSON document.
pub(crate) fn write_json<T: Serialize>(storage: &dyn Storage, path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| Error::json(path, err))?;
    storage.write(path, &bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_open_local() {
        let home = Path::new("/tmp/home");
        assert_eq!(open(None, home).unwrap().root(), home);
        assert_eq!(open(Some("  "), home).unwrap().root(), home);
        assert_eq!(
            open(Some("file:///data/lab"), home).unwrap().root(),
            Path::new("/data/lab")
        );
        assert_eq!(
            open(Some("/data/lab"), home).unwrap().root(),
            Path::new("/data/lab")
        );
    }

    #[test]
    fn test_open_remote_is_unsupported() {
        let home = Path::new("/tmp/home");
        for uri in ["s3://bucket/lab", "gs://bucket", "abfs://container", "ftp://host/lab"] {
            assert!(
                matches!(open(Some(uri), home), Err(Error::UnsupportedStorage(_))),
                "{uri}"
            );
        }
    }
}
