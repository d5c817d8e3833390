//! Datasets registered in the workspace.

use crate::dirs::Dirs;
use crate::error::Result;
use crate::filename::secure_filename;
use crate::resource::{lenient_id, LabResource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// The metadata document of a dataset.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DatasetRecord {
    #[serde(default, deserialize_with = "lenient_id")]
    pub dataset_id: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub description: String,
    /// Size in bytes, or -1 if unknown.
    #[serde(default = "unknown_size")]
    pub size: i64,
    #[serde(default)]
    pub json_data: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_location() -> String {
    "local".into()
}

fn unknown_size() -> i64 {
    -1
}

/// Changes to dataset metadata. Fields left as [`None`] are not changed.
#[derive(Clone, Debug, Default)]
pub struct DatasetMetadata {
    pub location: Option<String>,
    pub description: Option<String>,
    pub size: Option<i64>,
    /// Merged into the existing `json_data`, key by key.
    pub json_data: Option<Map<String, Value>>,
}

/// A dataset in the workspace.
#[derive(Clone, Debug)]
pub struct Dataset {
    dirs: Dirs,
    id: String,
}

impl LabResource for Dataset {
    const KIND: &'static str = "dataset";
    type Record = DatasetRecord;

    fn root(dirs: &Dirs) -> PathBuf {
        dirs.datasets_dir()
    }

    fn new(dirs: &Dirs, id: &str) -> Self {
        Self {
            dirs: dirs.clone(),
            id: id.into(),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn dirs(&self) -> &Dirs {
        &self.dirs
    }

    fn dir_name(id: &str) -> String {
        secure_filename(id)
    }

    fn default_record(&self) -> DatasetRecord {
        DatasetRecord {
            dataset_id: self.id.clone(),
            location: default_location(),
            description: String::new(),
            size: unknown_size(),
            json_data: Map::new(),
            extra: Map::new(),
        }
    }
}

impl Dataset {
    pub fn set_metadata(&self, metadata: DatasetMetadata) -> Result<()> {
        self.update(|record| {
            if let Some(location) = metadata.location {
                record.location = location;
            }
            if let Some(description) = metadata.description {
                record.description = description;
            }
            if let Some(size) = metadata.size {
                record.size = size;
            }
            if let Some(json_data) = metadata.json_data {
                record.json_data.extend(json_data);
            }
        })
    }

    pub fn metadata(&self) -> Result<DatasetRecord> {
        self.record()
    }

    /// The metadata of every readable dataset in the workspace.
    pub fn list_all(dirs: &Dirs) -> Result<Vec<DatasetRecord>> {
        let mut datasets = vec![];
        for id in Self::list_ids(dirs)? {
            match Self::new(dirs, &id).metadata() {
                Ok(record) => datasets.push(record),
                Err(err) => tracing::warn!("skipping unreadable dataset {id}: {err}"),
            }
        }
        Ok(datasets)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dirs::test::scratch;
    use serde_json::json;

    #[test]
    fn test_defaults_and_merge() {
        let (_tmp, dirs) = scratch();
        let ds = Dataset::create(&dirs, "alpaca").unwrap();
        assert!(ds.dir().ends_with("datasets/alpaca"));

        let record = ds.metadata().unwrap();
        assert_eq!(record.location, "local");
        assert_eq!(record.size, -1);

        let mut json_data = Map::new();
        json_data.insert("split".into(), "train".into());
        ds.set_metadata(DatasetMetadata {
            description: Some("instructions".into()),
            json_data: Some(json_data),
            ..Default::default()
        })
        .unwrap();

        let mut json_data = Map::new();
        json_data.insert("rows".into(), 52002.into());
        ds.set_metadata(DatasetMetadata {
            size: Some(1024),
            json_data: Some(json_data),
            ..Default::default()
        })
        .unwrap();

        let record = ds.metadata().unwrap();
        assert_eq!(record.description, "instructions");
        assert_eq!(record.size, 1024);
        assert_eq!(
            Value::Object(record.json_data),
            json!({"split": "train", "rows": 52002})
        );
    }

    #[test]
    fn test_list_all_skips_unreadable() {
        let (_tmp, dirs) = scratch();
        Dataset::create(&dirs, "good").unwrap();
        let bad = Dataset::create(&dirs, "bad").unwrap();
        dirs.storage().write(&bad.index_path(), b"{not json").unwrap();

        let all = Dataset::list_all(&dirs).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].dataset_id, "good");
    }
}
