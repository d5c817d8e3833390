//! Workspace-wide key/value settings.

use crate::dirs::Dirs;
use crate::error::Result;
use crate::filename::secure_filename;
use crate::resource::LabResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ConfigRecord {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One setting, stored at `config/<key>`.
#[derive(Clone, Debug)]
pub struct Config {
    dirs: Dirs,
    key: String,
}

impl LabResource for Config {
    const KIND: &'static str = "config";
    type Record = ConfigRecord;

    fn root(dirs: &Dirs) -> PathBuf {
        dirs.config_dir()
    }

    fn new(dirs: &Dirs, key: &str) -> Self {
        Self {
            dirs: dirs.clone(),
            key: key.into(),
        }
    }

    fn id(&self) -> &str {
        &self.key
    }

    fn dirs(&self) -> &Dirs {
        &self.dirs
    }

    fn dir_name(key: &str) -> String {
        secure_filename(key)
    }

    fn default_record(&self) -> ConfigRecord {
        ConfigRecord {
            key: self.key.clone(),
            value: Value::Null,
            extra: Map::new(),
        }
    }
}

impl Config {
    pub fn value(&self) -> Result<Value> {
        Ok(self.record()?.value)
    }

    pub fn set_value(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.update(|record| record.value = value)
    }

    /// The value of setting `key`, or [`None`] if it has never been set.
    pub fn value_by_key(dirs: &Dirs, key: &str) -> Result<Option<Value>> {
        match Self::get(dirs, key) {
            Ok(config) => Ok(Some(config.value()?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Set `key` to `value`, creating the setting if needed.
    pub fn set_value_by_key(dirs: &Dirs, key: &str, value: impl Into<Value>) -> Result<()> {
        let config = match Self::get(dirs, key) {
            Err(err) if err.is_not_found() => Self::create(dirs, key)?,
            res => res?,
        };
        config.set_value(value)
    }
}
