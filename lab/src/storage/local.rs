//! Storage on the local file system.

use super::Storage;
use crate::error::{Error, Result};
use copy_dir::copy_dir;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter distinguishing temporary files written by this process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A workspace on the local file system.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Storage for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|err| Error::io(path, err))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path).map_err(|err| Error::io(path, err))
    }

    fn list(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for dirent in path.read_dir().map_err(|err| Error::io(path, err))? {
            match dirent {
                Ok(de) => entries.push(de.path()),
                Err(err) => {
                    tracing::error!("unable to read directory {}: {err}", path.display());
                }
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn find(&self, path: &Path) -> Result<Vec<PathBuf>> {
        if path.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }
        let mut files = Vec::new();
        let mut pending = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in self.list(&dir)? {
                if entry.is_dir() {
                    pending.push(entry);
                } else {
                    files.push(entry);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|err| Error::io(path, err))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = File::open(path).map_err(|err| Error::io(path, err))?;
        Ok(Box::new(file))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        // Write next to the target and rename over it, so the replacement is atomic.
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(
            ".{file_name}.{}.{}.tmp",
            process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, contents).map_err(|err| Error::io(&tmp, err))?;
        fs::rename(&tmp, path).map_err(|err| {
            let _ = fs::remove_file(&tmp);
            Error::io(path, err)
        })
    }

    fn append(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| Error::io(path, err))?;
        file.write_all(contents).map_err(|err| Error::io(path, err))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(Error::io(path, err)),
            _ => Ok(()),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(Error::io(path, err)),
            _ => Ok(()),
        }
    }

    fn copy_file(&self, src: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            self.create_dir_all(parent)?;
        }
        fs::copy(src, dest).map_err(|err| Error::io(src, err))?;
        Ok(())
    }

    fn copy_dir(&self, src: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            self.create_dir_all(parent)?;
        }
        // `copy_dir` reports files it could not copy instead of failing outright.
        let skipped = copy_dir(src, dest).map_err(|err| Error::io(src, err))?;
        for err in &skipped {
            tracing::warn!("unable to copy part of {}: {err}", src.display());
        }
        Ok(())
    }

    fn copy_in(&self, src: &Path, dest: &Path) -> Result<()> {
        if src.is_dir() {
            self.remove_dir_all(dest)?;
            self.copy_dir(src, dest)
        } else {
            if dest.is_dir() {
                self.remove_dir_all(dest)?;
            }
            self.copy_file(src, dest)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_replaces_atomically() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let path = tmp.path().join("nested/index.json");

        storage.write(&path, b"first").unwrap();
        storage.write(&path, b"second").unwrap();
        assert_eq!(storage.read(&path).unwrap(), b"second");

        // No temporary files are left behind.
        assert_eq!(storage.list(path.parent().unwrap()).unwrap(), vec![path]);
    }

    #[test]
    fn test_create_dir_reserves_once() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let dir = tmp.path().join("7");

        storage.create_dir(&dir).unwrap();
        match storage.create_dir(&dir) {
            Err(Error::Io { source, .. }) => assert_eq!(source.kind(), ErrorKind::AlreadyExists),
            res => panic!("expected AlreadyExists, got {res:?}"),
        }
    }

    #[test]
    fn test_find_and_copy_in() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let src = tmp.path().join("src");
        storage.write(&src.join("a.txt"), b"a").unwrap();
        storage.write(&src.join("sub/b.txt"), b"b").unwrap();

        let dest = tmp.path().join("dest");
        storage.write(&dest.join("stale.txt"), b"old").unwrap();
        storage.copy_in(&src, &dest).unwrap();

        assert_eq!(
            storage.find(&dest).unwrap(),
            vec![dest.join("a.txt"), dest.join("sub/b.txt")]
        );
        assert_eq!(storage.read(&dest.join("sub/b.txt")).unwrap(), b"b");

        storage.remove_dir_all(&dest).unwrap();
        storage.remove_dir_all(&dest).unwrap();
        assert!(!storage.exists(&dest));
    }

    #[test]
    fn test_append() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let path = tmp.path().join("log.txt");
        storage.append(&path, b"one\n").unwrap();
        storage.append(&path, b"two\n").unwrap();
        assert_eq!(storage.read(&path).unwrap(), b"one\ntwo\n");
    }
}
