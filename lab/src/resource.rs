//! The contract shared by everything stored in a workspace.
//!
//! Every lab resource is a directory holding an `index.json` metadata document. Resources of the
//! same kind share a parent directory, and each is named by its ID (sanitized, for kinds whose
//! IDs come from users).

use crate::dirs::Dirs;
use crate::error::{Error, Result};
use crate::storage::{read_json, write_json};
use serde::{
    de::{DeserializeOwned, Deserializer, Error as _},
    Deserialize, Serialize,
};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// The metadata document inside every resource directory.
pub const INDEX_FILE: &str = "index.json";

/// A resource stored in a workspace.
pub trait LabResource: Sized {
    /// What kind of resource this is, for messages.
    const KIND: &'static str;

    /// The metadata document.
    type Record: Serialize + DeserializeOwned;

    /// The directory holding all resources of this kind.
    fn root(dirs: &Dirs) -> PathBuf;

    /// A handle to the resource `id`. This does not touch storage.
    fn new(dirs: &Dirs, id: &str) -> Self;

    fn id(&self) -> &str;

    fn dirs(&self) -> &Dirs;

    /// Metadata for a newly created resource.
    fn default_record(&self) -> Self::Record;

    /// The name of the directory for resource `id`.
    fn dir_name(id: &str) -> String {
        id.into()
    }

    /// The directory where this resource is stored.
    fn dir(&self) -> PathBuf {
        Self::root(self.dirs()).join(Self::dir_name(self.id()))
    }

    fn index_path(&self) -> PathBuf {
        self.dir().join(INDEX_FILE)
    }

    /// Extra setup for a newly created resource, after its default metadata is written.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Create a new resource with default metadata.
    ///
    /// Fails with [`Error::AlreadyExists`] if the resource directory is already present.
    fn create(dirs: &Dirs, id: &str) -> Result<Self> {
        check_id::<Self>(id)?;
        let res = Self::new(dirs, id);
        let storage = dirs.storage();
        storage.create_dir_all(&Self::root(dirs))?;
        match storage.create_dir(&res.dir()) {
            Err(Error::Io { source, .. }) if source.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists {
                    kind: Self::KIND,
                    id: id.into(),
                });
            }
            other => other?,
        }
        res.set_record(&res.default_record())?;
        res.initialize()?;
        tracing::debug!("created {} {id}", Self::KIND);
        Ok(res)
    }

    /// Open an existing resource.
    ///
    /// Fails with [`Error::NotFound`] if the resource directory does not exist.
    fn get(dirs: &Dirs, id: &str) -> Result<Self> {
        check_id::<Self>(id)?;
        let res = Self::new(dirs, id);
        if !dirs.storage().is_dir(&res.dir()) {
            return Err(Error::NotFound {
                kind: Self::KIND,
                id: id.into(),
            });
        }
        Ok(res)
    }

    /// Does this resource exist in storage?
    fn exists(&self) -> bool {
        self.dirs().storage().is_dir(&self.dir())
    }

    /// Read the metadata document, or the defaults if none has been written.
    fn record(&self) -> Result<Self::Record> {
        let path = self.index_path();
        if !self.dirs().storage().is_file(&path) {
            return Ok(self.default_record());
        }
        read_json(self.dirs().storage(), &path)
    }

    /// Replace the metadata document.
    fn set_record(&self, record: &Self::Record) -> Result<()> {
        write_json(self.dirs().storage(), &self.index_path(), record)
    }

    /// Read, modify and write back the metadata document.
    fn update<T>(&self, f: impl FnOnce(&mut Self::Record) -> T) -> Result<T> {
        let mut record = self.record()?;
        let ret = f(&mut record);
        self.set_record(&record)?;
        Ok(ret)
    }

    /// Remove this resource and everything in its directory.
    fn delete(self) -> Result<()> {
        self.dirs().storage().remove_dir_all(&self.dir())
    }

    /// The directory names of all resources of this kind, sorted.
    fn list_ids(dirs: &Dirs) -> Result<Vec<String>> {
        let root = Self::root(dirs);
        let storage = dirs.storage();
        if !storage.is_dir(&root) {
            return Ok(vec![]);
        }
        Ok(storage
            .list(&root)?
            .into_iter()
            .filter(|path| storage.is_dir(path))
            .filter_map(|path| file_name(&path))
            .collect())
    }
}

/// Reject IDs that would not name a single directory under the resource root.
fn check_id<R: LabResource>(id: &str) -> Result<()> {
    let name = R::dir_name(id);
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Error::InvalidArgument(format!(
            "{id:?} is not a valid {} ID",
            R::KIND
        )));
    }
    Ok(())
}

fn file_name(path: &Path) -> Option<String> {
    Some(path.file_name()?.to_str()?.to_string())
}

/// Deserialize an ID which may have been written as a string, a number or null.
pub(crate) fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("invalid ID {other}"))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dirs::test::scratch;
    use crate::job::Job;

    #[test]
    fn test_create_get() {
        let (_tmp, dirs) = scratch();

        let job = Job::create(&dirs, "123").unwrap();
        assert!(job.dir().is_dir());
        assert!(job.dir().join(INDEX_FILE).is_file());

        let job = Job::get(&dirs, "123").unwrap();
        assert_eq!(job.id(), "123");

        assert!(matches!(
            Job::create(&dirs, "123"),
            Err(Error::AlreadyExists { kind: "job", .. })
        ));
        assert!(Job::get(&dirs, "456").unwrap_err().is_not_found());
    }

    #[test]
    fn test_invalid_ids() {
        let (_tmp, dirs) = scratch();
        for id in ["", ".", "..", "a/b", "..\\x"] {
            assert!(
                matches!(Job::create(&dirs, id), Err(Error::InvalidArgument(_))),
                "{id:?}"
            );
        }
    }

    #[test]
    fn test_missing_index_reads_defaults() {
        let (_tmp, dirs) = scratch();
        let job = Job::create(&dirs, "9").unwrap();
        dirs.storage().remove_file(&job.index_path()).unwrap();
        assert_eq!(job.record().unwrap().progress, 0);
    }

    #[test]
    fn test_list_ids_and_delete() {
        let (_tmp, dirs) = scratch();
        assert!(Job::list_ids(&dirs).unwrap().is_empty());
        Job::create(&dirs, "2").unwrap();
        Job::create(&dirs, "1").unwrap();
        assert_eq!(Job::list_ids(&dirs).unwrap(), ["1", "2"]);

        Job::get(&dirs, "1").unwrap().delete().unwrap();
        assert_eq!(Job::list_ids(&dirs).unwrap(), ["2"]);
    }
}
