//! Long-running jobs: their status, progress, data and outputs.

use crate::dirs::Dirs;
use crate::error::{Error, Result};
use crate::experiment::Experiment;
use crate::resource::{lenient_id, LabResource};
use chrono::NaiveDateTime;
use serde::{de::Deserializer, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::PathBuf;
use strum::{Display, EnumString};

/// The job type used when none is given.
pub const DEFAULT_JOB_TYPE: &str = "TRAIN";

/// How many candidate IDs [`Job::create_next`] tries before giving up.
const MAX_ID_ATTEMPTS: u64 = 1000;

/// The lifecycle state of a job.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    Deserialize,
    Serialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    NotStarted,
    Queued,
    Running,
    Stopping,
    Stopped,
    Complete,
    Failed,
    Cancelled,
    Deleted,
}

/// How the work a job was doing turned out.
///
/// A job can be [`Complete`](JobStatus::Complete) and still have failed at its task.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CompletionStatus {
    Success,
    Failed,
}

/// The metadata document of a job.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct JobRecord {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_id")]
    pub experiment_id: String,
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: u8,
    #[serde(default)]
    pub job_data: Map<String, Value>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    /// Fields written by other tools, preserved as is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_job_type() -> String {
    DEFAULT_JOB_TYPE.into()
}

/// Accept any JSON number as a progress percentage, clamped to `0..=100`.
fn deserialize_progress<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u8, D::Error> {
    let progress = Option::<f64>::deserialize(d)?.unwrap_or_default();
    Ok(progress.round().clamp(0., 100.) as u8)
}

/// A job in the workspace.
#[derive(Clone, Debug)]
pub struct Job {
    dirs: Dirs,
    id: String,
}

impl LabResource for Job {
    const KIND: &'static str = "job";
    type Record = JobRecord;

    fn root(dirs: &Dirs) -> PathBuf {
        dirs.jobs_dir()
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

    fn default_record(&self) -> JobRecord {
        let now = crate::now();
        JobRecord {
            id: self.id.clone(),
            experiment_id: String::new(),
            job_type: default_job_type(),
            status: JobStatus::NotStarted,
            progress: 0,
            job_data: Map::new(),
            created_at: Some(now),
            updated_at: Some(now),
            extra: Map::new(),
        }
    }
}

impl Job {
    /// Create a job with the next free numeric ID.
    ///
    /// IDs are reserved by creating the job directory, so concurrent callers, even in different
    /// processes, never receive the same ID.
    pub fn create_next(dirs: &Dirs) -> Result<Self> {
        let next = Self::list_ids(dirs)?
            .iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1);
        for id in next..next + MAX_ID_ATTEMPTS {
            match Self::create(dirs, &id.to_string()) {
                Err(Error::AlreadyExists { .. }) => continue,
                res => return res,
            }
        }
        Err(Error::io(
            dirs.jobs_dir(),
            ErrorKind::AlreadyExists.into(),
        ))
    }

    /// Modify the job record and bump its `updated_at` timestamp.
    fn touch<T>(&self, f: impl FnOnce(&mut JobRecord) -> T) -> Result<T> {
        self.update(|record| {
            record.updated_at = Some(crate::now());
            f(record)
        })
    }

    pub fn status(&self) -> Result<JobStatus> {
        Ok(self.record()?.status)
    }

    pub fn update_status(&self, status: JobStatus) -> Result<()> {
        tracing::debug!(job = %self.id, %status, "status update");
        self.touch(|record| record.status = status)
    }

    pub fn progress(&self) -> Result<u8> {
        Ok(self.record()?.progress)
    }

    /// Update the percent complete for this job. Values above 100 are clamped.
    pub fn update_progress(&self, progress: u8) -> Result<()> {
        self.touch(|record| record.progress = progress.min(100))
    }

    pub fn job_type(&self) -> Result<String> {
        Ok(self.record()?.job_type)
    }

    pub fn set_job_type(&self, job_type: &str) -> Result<()> {
        self.touch(|record| record.job_type = job_type.into())
    }

    /// The experiment this job belongs to, if any.
    pub fn experiment_id(&self) -> Result<Option<String>> {
        let id = self.record()?.experiment_id;
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    /// Assign this job to `experiment`.
    ///
    /// If the experiment exists, the job is also added to its jobs index, and it is removed from
    /// the index of the experiment it previously belonged to.
    pub fn set_experiment(&self, experiment: &str) -> Result<()> {
        let (previous, job_type) = self.touch(|record| {
            let previous = std::mem::replace(&mut record.experiment_id, experiment.into());
            (previous, record.job_type.clone())
        })?;
        if !previous.is_empty() && previous != experiment {
            if let Ok(previous) = Experiment::get(&self.dirs, &previous) {
                previous.remove_job(&self.id)?;
            }
        }
        if let Ok(experiment) = Experiment::get(&self.dirs, experiment) {
            experiment.add_job(&self.id, &job_type)?;
        }
        Ok(())
    }

    pub fn job_data(&self) -> Result<Map<String, Value>> {
        Ok(self.record()?.job_data)
    }

    /// Replace the whole `job_data` object.
    pub fn set_job_data(&self, job_data: Map<String, Value>) -> Result<()> {
        self.touch(|record| record.job_data = job_data)
    }

    /// Set one key of the `job_data` object.
    pub fn update_job_data_field(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.touch(|record| {
            record.job_data.insert(key.into(), value);
        })
    }

    pub fn set_tensorboard_output_dir(&self, dir: &str) -> Result<()> {
        self.update_job_data_field("tensorboard_output_dir", dir)
    }

    /// Record how the work of this job turned out.
    ///
    /// `status` must be `"success"` or `"failed"`. `score` should be an object of the form
    /// `{"metric_name": value, ...}`.
    pub fn set_job_completion_status(
        &self,
        status: &str,
        details: &str,
        score: Option<Value>,
        additional_output_path: Option<&str>,
        plot_data_path: Option<&str>,
    ) -> Result<()> {
        let status: CompletionStatus = status
            .parse()
            .map_err(|_| Error::InvalidCompletionStatus(status.into()))?;
        self.touch(|record| {
            let data = &mut record.job_data;
            data.insert("completion_status".into(), status.to_string().into());
            data.insert("completion_details".into(), details.into());
            if let Some(score) = score {
                data.insert("score".into(), score);
            }
            for (key, path) in [
                ("additional_output_path", additional_output_path),
                ("plot_data_path", plot_data_path),
            ] {
                if let Some(path) = path.filter(|path| !path.trim().is_empty()) {
                    data.insert(key.into(), path.into());
                }
            }
        })
    }

    /// Ask the process running this job to stop.
    pub fn request_stop(&self) -> Result<()> {
        self.update_job_data_field("stop", true)
    }

    /// Has someone asked this job to stop?
    pub fn should_stop(&self) -> Result<bool> {
        Ok(self
            .job_data()?
            .get("stop")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// The file collecting this job's log output.
    pub fn log_path(&self) -> PathBuf {
        self.dir().join(format!("output_{}.txt", self.id))
    }

    /// Append a timestamped line to the job log.
    pub fn log_info(&self, message: &str) -> Result<()> {
        tracing::info!(job = %self.id, "{message}");
        let line = format!("[{}] {message}\n", crate::now().format("%Y-%m-%d %H:%M:%S"));
        self.dirs.storage().append(&self.log_path(), line.as_bytes())
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.dirs.job_checkpoints_dir(&self.id)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dirs.job_artifacts_dir(&self.id)
    }

    /// The checkpoints saved by this job, sorted.
    pub fn checkpoint_paths(&self) -> Result<Vec<PathBuf>> {
        self.entries(self.checkpoints_dir())
    }

    /// The artifacts saved by this job, sorted.
    pub fn artifact_paths(&self) -> Result<Vec<PathBuf>> {
        self.entries(self.artifacts_dir())
    }

    fn entries(&self, dir: PathBuf) -> Result<Vec<PathBuf>> {
        let storage = self.dirs.storage();
        if storage.is_dir(&dir) {
            storage.list(&dir)
        } else {
            Ok(vec![])
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dirs::test::scratch;
    use crate::resource::INDEX_FILE;
    use serde_json::json;
    use std::collections::HashSet;
    use std::fs;

    #[test]
    fn test_default_json_and_updates() {
        let (_tmp, dirs) = scratch();
        let job = Job::create(&dirs, "1").unwrap();

        let data: Value =
            serde_json::from_slice(&fs::read(job.dir().join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(data["status"], "NOT_STARTED");
        assert_eq!(data["progress"], 0);
        assert_eq!(data["type"], "TRAIN");

        job.update_status(JobStatus::Running).unwrap();
        job.update_progress(50).unwrap();
        job.update_job_data_field("k", "v").unwrap();

        let record = Job::get(&dirs, "1").unwrap().record().unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.progress, 50);
        assert_eq!(record.job_data["k"], "v");

        job.update_progress(250).unwrap();
        assert_eq!(job.progress().unwrap(), 100);
    }

    #[test]
    fn test_completion_status_validation() {
        let (_tmp, dirs) = scratch();
        let job = Job::create(&dirs, "2").unwrap();

        assert!(matches!(
            job.set_job_completion_status("invalid", "", None, None, None),
            Err(Error::InvalidCompletionStatus(_))
        ));

        job.set_job_completion_status("success", "ok", Some(json!({"acc": 1})), Some("  "), None)
            .unwrap();
        let data = job.job_data().unwrap();
        assert_eq!(data["completion_status"], "success");
        assert_eq!(data["completion_details"], "ok");
        assert_eq!(data["score"], json!({"acc": 1}));
        assert!(!data.contains_key("additional_output_path"));
    }

    #[test]
    fn test_create_next() {
        let (_tmp, dirs) = scratch();
        assert_eq!(Job::create_next(&dirs).unwrap().id(), "1");
        Job::create(&dirs, "41").unwrap();
        Job::create(&dirs, "not-a-number").unwrap();
        assert_eq!(Job::create_next(&dirs).unwrap().id(), "42");
        assert_eq!(Job::create_next(&dirs).unwrap().id(), "43");
    }

    #[test]
    fn test_create_next_concurrently() {
        let (_tmp, dirs) = scratch();
        let workers = 16;
        let ids: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| s.spawn(|| Job::create_next(&dirs).unwrap().id().to_string()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let distinct: HashSet<_> = ids.iter().collect();
        assert_eq!(distinct.len(), workers);
        assert_eq!(Job::list_ids(&dirs).unwrap().len(), workers);
    }

    #[test]
    fn test_record_without_id() {
        let (_tmp, dirs) = scratch();
        let job = Job::create(&dirs, "8").unwrap();
        fs::write(job.index_path(), json!({"status": "QUEUED"}).to_string()).unwrap();
        let record = job.record().unwrap();
        assert_eq!(record.id, "");
        assert_eq!(record.status, JobStatus::Queued);
    }

    #[test]
    fn test_reads_foreign_records() {
        let (_tmp, dirs) = scratch();
        let job = Job::create(&dirs, "5").unwrap();
        fs::write(
            job.index_path(),
            json!({
                "id": 5,
                "experiment_id": 3,
                "status": "RUNNING",
                "progress": 33.6,
                "job_data": {"model_name": "smol"},
                "plugin": "trainer",
            })
            .to_string(),
        )
        .unwrap();

        let record = job.record().unwrap();
        assert_eq!(record.id, "5");
        assert_eq!(record.experiment_id, "3");
        assert_eq!(record.job_type, "TRAIN");
        assert_eq!(record.progress, 34);

        // Unknown fields survive a rewrite.
        job.update_status(JobStatus::Complete).unwrap();
        let data: Value = serde_json::from_slice(&fs::read(job.index_path()).unwrap()).unwrap();
        assert_eq!(data["plugin"], "trainer");
        assert_eq!(data["status"], "COMPLETE");
    }

    #[test]
    fn test_log_and_stop() {
        let (_tmp, dirs) = scratch();
        let job = Job::create(&dirs, "6").unwrap();
        job.log_info("hello").unwrap();
        job.log_info("world").unwrap();
        let log = fs::read_to_string(job.log_path()).unwrap();
        assert!(job.log_path().ends_with("jobs/6/output_6.txt"));
        assert_eq!(log.lines().count(), 2);
        assert!(log.lines().last().unwrap().ends_with("] world"));

        assert!(!job.should_stop().unwrap());
        job.request_stop().unwrap();
        assert!(job.should_stop().unwrap());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::NotStarted.to_string(), "NOT_STARTED");
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!(CompletionStatus::Failed.to_string(), "failed");
    }
}
