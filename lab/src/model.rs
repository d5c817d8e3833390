//! Models stored in the workspace, with their metadata, checksums and provenance.

use crate::dirs::Dirs;
use crate::error::{Error, Result};
use crate::filename::secure_filename;
use crate::resource::{lenient_id, LabResource};
use crate::storage::{read_json, write_json};
use derive_more::Into;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The provenance document written next to saved models.
pub const PROVENANCE_FILE: &str = "_tlab_provenance.json";

/// The architecture recorded when none can be detected.
pub const UNKNOWN_ARCHITECTURE: &str = "Unknown";

const HUB_API: &str = "https://huggingface.co/api/models/";
const HUB_TIMEOUT: Duration = Duration::from_secs(10);

/// The metadata document of a model.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ModelRecord {
    #[serde(default, deserialize_with = "lenient_id")]
    pub model_id: String,
    #[serde(default)]
    pub name: String,
    /// For single-file models, the name of the file within the model directory.
    #[serde(default)]
    pub model_filename: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub json_data: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The checksum of one file of a model.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileChecksum {
    /// Path relative to the model directory.
    pub file_path: String,
    pub sha256: String,
}

/// Where a model came from.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Provenance {
    pub job_id: String,
    pub model_name: Option<String>,
    pub model_architecture: String,
    pub input_model: Option<String>,
    pub dataset: Option<Value>,
    pub adaptor_name: Option<Value>,
    pub parameters: Value,
    pub start_time: Value,
    pub end_time: String,
    pub checksums: Vec<FileChecksum>,
}

/// A model in the workspace.
#[derive(Clone, Debug)]
pub struct Model {
    dirs: Dirs,
    id: String,
}

impl LabResource for Model {
    const KIND: &'static str = "model";
    type Record = ModelRecord;

    fn root(dirs: &Dirs) -> PathBuf {
        dirs.models_dir()
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

    fn default_record(&self) -> ModelRecord {
        ModelRecord {
            model_id: self.id.clone(),
            name: self.id.clone(),
            model_filename: String::new(),
            architecture: String::new(),
            json_data: Map::new(),
            extra: Map::new(),
        }
    }
}

impl Model {
    /// The metadata of every model in the workspace.
    pub fn list_all(dirs: &Dirs) -> Result<Vec<ModelRecord>> {
        let mut models = vec![];
        for id in Self::list_ids(dirs)? {
            match Self::new(dirs, &id).record() {
                Ok(record) => models.push(record),
                Err(err) => tracing::error!("unable to read model {id}: {err}"),
            }
        }
        Ok(models)
    }

    /// Write the metadata that makes this model show up in the model zoo.
    ///
    /// `json_data` is merged into any existing `json_data`.
    pub fn generate_model_json(
        &self,
        architecture: &str,
        model_filename: &str,
        json_data: Map<String, Value>,
    ) -> Result<()> {
        self.update(|record| {
            record.architecture = architecture.into();
            record.model_filename = model_filename.into();
            record.json_data.extend(json_data);
            record
                .json_data
                .insert("architecture".into(), architecture.into());
        })
    }

    /// Guess the architecture of the model at `path` from its `config.json`.
    ///
    /// Returns [`UNKNOWN_ARCHITECTURE`] for single files and for directories without a readable
    /// `architectures` list.
    pub fn detect_architecture(&self, path: &Path) -> String {
        let storage = self.dirs.storage();
        let config = path.join("config.json");
        if !storage.is_file(&config) {
            return UNKNOWN_ARCHITECTURE.into();
        }
        match read_json::<Value>(storage, &config) {
            Ok(config) => config["architectures"]
                .get(0)
                .and_then(Value::as_str)
                .unwrap_or(UNKNOWN_ARCHITECTURE)
                .into(),
            Err(err) => {
                tracing::warn!("unable to detect architecture: {err}");
                UNKNOWN_ARCHITECTURE.into()
            }
        }
    }

    /// SHA-256 checksums of every file at `path` (a file or a directory).
    pub fn create_checksums(&self, path: &Path) -> Result<Vec<FileChecksum>> {
        let storage = self.dirs.storage();
        let base = if storage.is_dir(path) {
            path
        } else {
            path.parent().unwrap_or(path)
        };
        storage
            .find(path)?
            .into_iter()
            .map(|file| {
                let mut hasher = Sha256::new();
                let mut reader = storage.open_read(&file)?;
                io::copy(&mut reader, &mut hasher).map_err(|err| Error::io(&file, err))?;
                Ok(FileChecksum {
                    file_path: file
                        .strip_prefix(base)
                        .unwrap_or(&file)
                        .to_string_lossy()
                        .into_owned(),
                    sha256: format!("{:x}", hasher.finalize()),
                })
            })
            .collect()
    }

    /// Write the provenance document into the model directory.
    pub fn create_provenance_file(&self, provenance: &Provenance) -> Result<PathBuf> {
        let path = self.dir().join(PROVENANCE_FILE);
        write_json(self.dirs.storage(), &path, provenance)?;
        Ok(path)
    }
}

/// Response from the Hugging Face model API.
#[derive(Clone, Debug, Deserialize, Into)]
struct HubModel {
    #[serde(default)]
    pipeline_tag: Option<String>,
}

/// Look up the pipeline tag of a model on the Hugging Face Hub.
///
/// Any failure, including the model not existing, yields [`None`].
pub async fn fetch_pipeline_tag(model: &str) -> Option<String> {
    let client: surf::Client = match surf::Config::new().set_timeout(Some(HUB_TIMEOUT)).try_into()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!("unable to build HTTP client: {err}");
            return None;
        }
    };
    match client
        .get(format!("{HUB_API}{model}"))
        .recv_json::<HubModel>()
        .await
    {
        Ok(res) => res.into(),
        Err(err) => {
            tracing::debug!("unable to fetch pipeline tag for {model}: {err}");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dirs::test::scratch;
    use serde_json::json;

    #[test]
    fn test_dir() {
        let (_tmp, dirs) = scratch();
        let model = Model::new(&dirs, "mixtral-8x7b");
        assert!(model.dir().ends_with("models/mixtral-8x7b"));

        let model = Model::new(&dirs, "org/My Model");
        assert!(model.dir().ends_with("models/org_My_Model"));
    }

    #[test]
    fn test_generate_model_json() {
        let (_tmp, dirs) = scratch();
        let model = Model::create(&dirs, "7_smol").unwrap();
        let mut json_data = Map::new();
        json_data.insert("job_id".into(), "7".into());
        model
            .generate_model_json("LlamaForCausalLM", "", json_data)
            .unwrap();

        let record = model.record().unwrap();
        assert_eq!(record.architecture, "LlamaForCausalLM");
        assert_eq!(record.json_data["job_id"], "7");
        assert_eq!(record.json_data["architecture"], "LlamaForCausalLM");
        assert_eq!(Model::list_all(&dirs).unwrap(), [record]);
    }

    #[test]
    fn test_detect_architecture_and_checksums() {
        let (_tmp, dirs) = scratch();
        let model = Model::create(&dirs, "m").unwrap();
        let storage = dirs.storage();

        assert_eq!(model.detect_architecture(&model.dir()), UNKNOWN_ARCHITECTURE);
        storage
            .write(
                &model.dir().join("config.json"),
                json!({"architectures": ["GPT2LMHeadModel"]})
                    .to_string()
                    .as_bytes(),
            )
            .unwrap();
        assert_eq!(model.detect_architecture(&model.dir()), "GPT2LMHeadModel");

        storage
            .write(&model.dir().join("weights/model.bin"), b"abc")
            .unwrap();
        let checksums = model.create_checksums(&model.dir()).unwrap();
        let weights = checksums
            .iter()
            .find(|c| c.file_path == "weights/model.bin")
            .unwrap();
        assert_eq!(
            weights.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_provenance_file() {
        let (_tmp, dirs) = scratch();
        let model = Model::create(&dirs, "m").unwrap();
        let provenance = Provenance {
            job_id: "3".into(),
            model_name: Some("base".into()),
            ..Default::default()
        };
        let path = model.create_provenance_file(&provenance).unwrap();
        assert!(path.ends_with("models/m/_tlab_provenance.json"));
        let read: Provenance = read_json(dirs.storage(), &path).unwrap();
        assert_eq!(read, provenance);
    }
}
