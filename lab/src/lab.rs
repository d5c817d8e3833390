//! A simple facade for scripts running inside a job.
//!
//! A script opens a [`Lab`] once, then reports progress and saves its outputs through it:
//! checkpoints and artifacts go into the job directory, models into the workspace model zoo.
//! Everything saved is also recorded in the job's `job_data` so the application can find it.

use crate::dirs::Dirs;
use crate::error::{Error, Result};
use crate::experiment::Experiment;
use crate::job::{Job, JobStatus, DEFAULT_JOB_TYPE};
use crate::model::{self, Model, Provenance, UNKNOWN_ARCHITECTURE};
use crate::resource::LabResource;
use crate::workspace::Options;
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};

const WANDB_URL_KEY: &str = "wandb_run_url";

/// Optional details about a model passed to [`Lab::save_model`].
#[derive(Clone, Debug, Default)]
pub struct ModelInfo<'a> {
    /// Name of the saved model, before the job ID prefix. Defaults to the source file name.
    pub name: Option<&'a str>,
    /// Detected from `config.json` if not given.
    pub architecture: Option<&'a str>,
    /// Looked up from `parent_model` on the Hugging Face Hub if not given.
    pub pipeline_tag: Option<&'a str>,
    /// The model this one was derived from.
    pub parent_model: Option<&'a str>,
}

/// The job a script is running as, within its experiment.
#[derive(Clone, Debug)]
pub struct Lab {
    dirs: Dirs,
    experiment: Experiment,
    job: Job,
    /// The W&B run URL given when the job was started, if any.
    wandb_url: Option<String>,
}

impl Lab {
    /// Open the workspace described by `opt` and start a job in `experiment`.
    ///
    /// If `opt.job_id` is set, that job is resumed; otherwise a new job is created.
    pub async fn init(opt: &Options, experiment: &str) -> Result<Self> {
        let dirs = Dirs::open(opt).await?;
        Self::start(
            dirs,
            experiment,
            opt.job_id.as_deref(),
            opt.wandb_url.as_deref(),
        )
    }

    /// Start a job in an opened workspace.
    ///
    /// With `existing_job`, both the experiment and the job must already exist. Otherwise the
    /// experiment is created if necessary and a new job is created in it. Either way the job is
    /// marked [`Running`](JobStatus::Running).
    pub fn start(
        dirs: Dirs,
        experiment: &str,
        existing_job: Option<&str>,
        wandb_url: Option<&str>,
    ) -> Result<Self> {
        let (experiment, job) = match existing_job.filter(|id| !id.trim().is_empty()) {
            Some(id) => {
                let experiment = Experiment::get(&dirs, experiment)?;
                let job = Job::get(&dirs, id)?;
                tracing::info!("using existing job {id}");
                (experiment, job)
            }
            None => {
                let experiment = Experiment::open_or_create(&dirs, experiment)?;
                let job = experiment.create_job(DEFAULT_JOB_TYPE)?;
                tracing::info!("created new job {}", job.id());
                (experiment, job)
            }
        };
        job.update_status(JobStatus::Running)?;

        let lab = Self {
            dirs,
            experiment,
            job,
            wandb_url: wandb_url.filter(|url| !url.is_empty()).map(String::from),
        };
        if let Some(url) = &lab.wandb_url {
            lab.capture_wandb_url(url)?;
        }
        Ok(lab)
    }

    pub fn dirs(&self) -> &Dirs {
        &self.dirs
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Merge `config` into the job data.
    ///
    /// `experiment_name` is added unless `config` already has one.
    pub fn set_config(&self, mut config: Map<String, Value>) -> Result<()> {
        if !config.contains_key("experiment_name") {
            config.insert("experiment_name".into(), self.experiment.id().into());
        }
        let mut job_data = self.job.job_data()?;
        job_data.extend(config);
        self.job.set_job_data(job_data)
    }

    pub fn log(&self, message: &str) -> Result<()> {
        self.job.log_info(message)?;
        self.check_wandb_url()
    }

    pub fn update_progress(&self, progress: u8) -> Result<()> {
        self.job.update_progress(progress)?;
        self.check_wandb_url()
    }

    /// Mark the job complete and successful.
    pub fn finish(
        &self,
        message: &str,
        score: Option<Value>,
        additional_output_path: Option<&str>,
        plot_data_path: Option<&str>,
    ) -> Result<()> {
        self.job.update_progress(100)?;
        self.job.update_status(JobStatus::Complete)?;
        self.job.set_job_completion_status(
            "success",
            message,
            score,
            additional_output_path,
            plot_data_path,
        )
    }

    /// Mark the job failed.
    ///
    /// The failure is also recorded as `job_data.status`, where older readers look for it.
    pub fn error(&self, message: &str) -> Result<()> {
        self.job.update_status(JobStatus::Failed)?;
        self.job
            .set_job_completion_status("failed", message, None, None, None)?;
        self.job
            .update_job_data_field("status", JobStatus::Failed.to_string())
    }

    /// Record the URL of the Weights & Biases run for this job.
    pub fn capture_wandb_url(&self, url: &str) -> Result<()> {
        tracing::info!("detected wandb run URL: {url}");
        self.job.update_job_data_field(WANDB_URL_KEY, url)
    }

    /// Record the configured W&B run URL, or else one from the environment, unless a URL is
    /// already recorded.
    fn check_wandb_url(&self) -> Result<()> {
        if self.job.job_data()?.contains_key(WANDB_URL_KEY) {
            return Ok(());
        }
        let url = self
            .wandb_url
            .clone()
            .or_else(|| std::env::var("WANDB_URL").ok())
            .filter(|url| !url.is_empty());
        match url {
            Some(url) => self.capture_wandb_url(&url),
            None => Ok(()),
        }
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.job.checkpoints_dir()
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.job.artifacts_dir()
    }

    pub fn checkpoint_paths(&self) -> Result<Vec<PathBuf>> {
        self.job.checkpoint_paths()
    }

    pub fn artifact_paths(&self) -> Result<Vec<PathBuf>> {
        self.job.artifact_paths()
    }

    /// Copy a file or directory into this job's artifacts, returning where it was saved.
    pub fn save_artifact(&self, source: impl AsRef<Path>, name: Option<&str>) -> Result<PathBuf> {
        let dest = self.save_into("artifact", source.as_ref(), self.artifacts_dir(), name)?;
        self.push_job_data("artifacts", &dest)?;
        Ok(dest)
    }

    /// Copy a file or directory into this job's checkpoints, returning where it was saved.
    ///
    /// The saved checkpoint becomes `latest_checkpoint`.
    pub fn save_checkpoint(
        &self,
        source: impl AsRef<Path>,
        name: Option<&str>,
    ) -> Result<PathBuf> {
        let dest = self.save_into("checkpoint", source.as_ref(), self.checkpoints_dir(), name)?;
        self.push_job_data("checkpoints", &dest)?;
        self.job
            .update_job_data_field("latest_checkpoint", dest.to_string_lossy())?;
        Ok(dest)
    }

    /// Copy a model into the workspace model zoo as `<job id>_<name>`.
    ///
    /// The model metadata, checksums and provenance are written alongside it. Failing to write
    /// those is logged to the job but does not fail the save.
    pub async fn save_model(&self, source: impl AsRef<Path>, info: ModelInfo<'_>) -> Result<PathBuf> {
        let src = check_source("model", source.as_ref())?;
        let job_id = self.job.id();
        let name = match nonblank(info.name) {
            Some(name) => name.to_string(),
            None => file_name(&src),
        };
        check_name("model", &name)?;
        let model = Model::new(&self.dirs, &format!("{job_id}_{name}"));

        let storage = self.dirs.storage();
        let (dest, model_filename) = if src.is_dir() {
            (model.dir(), String::new())
        } else {
            let filename = file_name(&src);
            (model.dir().join(&filename), filename)
        };
        storage.copy_in(&src, &dest)?;

        let architecture = match info.architecture {
            Some(architecture) => architecture.to_string(),
            None => model.detect_architecture(&dest),
        };
        let pipeline_tag = match (info.pipeline_tag, info.parent_model) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, Some(parent)) => model::fetch_pipeline_tag(parent).await,
            (None, None) => None,
        };

        let mut json_data = Map::new();
        json_data.insert("job_id".into(), job_id.into());
        json_data.insert(
            "description".into(),
            format!("Model generated by job {job_id}").into(),
        );
        if let Some(tag) = pipeline_tag {
            json_data.insert("pipeline_tag".into(), tag.into());
        }
        // Checksums first, so they cover only the model files.
        let checksums = model.create_checksums(&dest);
        match model.generate_model_json(&architecture, &model_filename, json_data) {
            Ok(()) => self.log(&format!("Model saved to Model Zoo as '{}'", model.id()))?,
            Err(err) => self.warn(&format!("Model saved but metadata creation failed: {err}"))?,
        }

        match checksums.and_then(|checksums| {
            let provenance = self.provenance(&architecture, info.parent_model, checksums)?;
            model.create_provenance_file(&provenance)
        }) {
            Ok(path) => self.log(&format!("Provenance file created at: {}", path.display()))?,
            Err(err) => self.warn(&format!("Model saved but provenance creation failed: {err}"))?,
        }

        self.push_job_data("models", &dest)?;
        Ok(dest)
    }

    fn provenance(
        &self,
        architecture: &str,
        parent_model: Option<&str>,
        checksums: Vec<model::FileChecksum>,
    ) -> Result<Provenance> {
        let job_data = self.job.job_data()?;
        let model_name = parent_model.map(String::from).or_else(|| {
            job_data
                .get("model_name")
                .and_then(Value::as_str)
                .map(String::from)
        });
        Ok(Provenance {
            job_id: self.job.id().into(),
            model_name,
            model_architecture: if architecture.is_empty() {
                UNKNOWN_ARCHITECTURE.into()
            } else {
                architecture.into()
            },
            input_model: parent_model.map(String::from),
            dataset: job_data.get("dataset").cloned(),
            adaptor_name: job_data.get("adaptor_name").cloned(),
            parameters: job_data.get("_config").cloned().unwrap_or_else(|| json!({})),
            start_time: job_data.get("start_time").cloned().unwrap_or_else(|| json!("")),
            end_time: crate::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            checksums,
        })
    }

    fn warn(&self, message: &str) -> Result<()> {
        tracing::warn!(job = %self.job.id(), "{message}");
        self.job.log_info(&format!("Warning: {message}"))
    }

    fn save_into(
        &self,
        kind: &'static str,
        source: &Path,
        dir: PathBuf,
        name: Option<&str>,
    ) -> Result<PathBuf> {
        let src = check_source(kind, source)?;
        let name = match nonblank(name) {
            Some(name) => name.to_string(),
            None => file_name(&src),
        };
        let dest = dir.join(check_name(kind, &name)?);
        self.dirs.storage().copy_in(&src, &dest)?;
        tracing::debug!("saved {kind} {} to {}", src.display(), dest.display());
        Ok(dest)
    }

    /// Append `path` to the list at `key` in the job data.
    fn push_job_data(&self, key: &str, path: &Path) -> Result<()> {
        let mut list = match self.job.job_data()?.remove(key) {
            Some(Value::Array(list)) => list,
            _ => vec![],
        };
        list.push(path.to_string_lossy().into());
        self.job.update_job_data_field(key, list)
    }
}

fn nonblank(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

/// Validate a source path given by the caller and make it absolute.
fn check_source(kind: &'static str, source: &Path) -> Result<PathBuf> {
    if source.as_os_str().to_string_lossy().trim().is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{kind} source path must not be empty"
        )));
    }
    let src = std::path::absolute(source).map_err(|err| Error::io(source, err))?;
    if !src.exists() {
        return Err(Error::NotFound {
            kind,
            id: src.display().to_string(),
        });
    }
    Ok(src)
}

/// Require `name` to be a single ordinary path component, so that it stays inside its directory.
fn check_name<'a>(kind: &str, name: &'a str) -> Result<&'a str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(name),
        _ => Err(Error::InvalidArgument(format!(
            "{kind} name {name:?} must be a single file name"
        ))),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
