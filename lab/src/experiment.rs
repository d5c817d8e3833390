//! Experiments group jobs together with shared configuration.

use crate::dirs::Dirs;
use crate::error::Result;
use crate::job::{Job, JobRecord, JobStatus, DEFAULT_JOB_TYPE};
use crate::resource::{lenient_id, LabResource};
use crate::storage::{read_json, write_json};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The index of an experiment's jobs, by job type.
pub const JOBS_INDEX_FILE: &str = "jobs.json";

/// Job IDs grouped by job type.
pub type JobsIndex = BTreeMap<String, Vec<String>>;

/// The metadata document of an experiment.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ExperimentRecord {
    #[serde(deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// The ID of this experiment in the application database, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_experiment_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An experiment in the workspace.
#[derive(Clone, Debug)]
pub struct Experiment {
    dirs: Dirs,
    id: String,
}

impl LabResource for Experiment {
    const KIND: &'static str = "experiment";
    type Record = ExperimentRecord;

    fn root(dirs: &Dirs) -> PathBuf {
        dirs.experiments_dir()
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

    fn dir(&self) -> PathBuf {
        self.dirs.experiment_dir_by_name(&self.id)
    }

    fn default_record(&self) -> ExperimentRecord {
        let now = crate::now();
        ExperimentRecord {
            id: self.id.clone(),
            name: self.id.clone(),
            config: Map::new(),
            db_experiment_id: None,
            created_at: Some(now),
            updated_at: Some(now),
            extra: Map::new(),
        }
    }

    fn initialize(&self) -> Result<()> {
        self.write_jobs_index(&default_jobs_index())
    }

    /// Remove this experiment and every indexed job that still belongs to it.
    fn delete(self) -> Result<()> {
        for id in self.job_ids()? {
            let job = match Job::get(&self.dirs, &id) {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!("skipping indexed job {id:?}: {err}");
                    continue;
                }
            };
            if job.experiment_id()?.as_deref() == Some(self.id.as_str()) {
                job.delete()?;
            }
        }
        self.dirs.storage().remove_dir_all(&self.dir())
    }
}

fn default_jobs_index() -> JobsIndex {
    [(DEFAULT_JOB_TYPE.to_string(), vec![])].into_iter().collect()
}

impl Experiment {
    /// Open the experiment `id`, creating it if it does not exist.
    pub fn open_or_create(dirs: &Dirs, id: &str) -> Result<Self> {
        match Self::create(dirs, id) {
            Err(crate::Error::AlreadyExists { .. }) => Self::get(dirs, id),
            res => res,
        }
    }

    /// The metadata of every experiment in the workspace.
    pub fn list_all(dirs: &Dirs) -> Result<Vec<ExperimentRecord>> {
        let mut experiments = vec![];
        for id in Self::list_ids(dirs)? {
            match Self::new(dirs, &id).record() {
                Ok(record) => experiments.push(record),
                Err(err) => tracing::error!("unable to read experiment {id}: {err}"),
            }
        }
        Ok(experiments)
    }

    pub fn config(&self) -> Result<Map<String, Value>> {
        Ok(self.record()?.config)
    }

    pub fn update_config_field(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.update(|record| {
            record.config.insert(key.into(), value);
            record.updated_at = Some(crate::now());
        })
    }

    /// Create a new job of type `job_type` in this experiment.
    pub fn create_job(&self, job_type: &str) -> Result<Job> {
        let job = Job::create_next(&self.dirs)?;
        job.set_job_type(job_type)?;
        job.set_experiment(&self.id)?;
        Ok(job)
    }

    pub fn jobs_index_path(&self) -> PathBuf {
        self.dir().join(JOBS_INDEX_FILE)
    }

    /// The jobs index, or an empty default if it has not been written.
    pub fn jobs_index(&self) -> Result<JobsIndex> {
        let path = self.jobs_index_path();
        if !self.dirs.storage().is_file(&path) {
            return Ok(default_jobs_index());
        }
        read_json(self.dirs.storage(), &path)
    }

    fn write_jobs_index(&self, index: &JobsIndex) -> Result<()> {
        write_json(self.dirs.storage(), &self.jobs_index_path(), index)
    }

    /// Add a job to the index under `job_type`. Adding a job twice has no effect.
    pub(crate) fn add_job(&self, id: &str, job_type: &str) -> Result<()> {
        let mut index = self.jobs_index()?;
        let ids = index.entry(job_type.into()).or_default();
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.into());
            self.write_jobs_index(&index)?;
        }
        Ok(())
    }

    /// Remove a job from the index, under every type.
    pub(crate) fn remove_job(&self, id: &str) -> Result<()> {
        let mut index = self.jobs_index()?;
        let mut changed = false;
        for ids in index.values_mut() {
            let before = ids.len();
            ids.retain(|existing| existing != id);
            changed |= ids.len() != before;
        }
        if changed {
            self.write_jobs_index(&index)?;
        }
        Ok(())
    }

    /// Rebuild the jobs index by scanning every job in the workspace.
    pub fn rebuild_jobs_index(&self) -> Result<()> {
        let mut index = default_jobs_index();
        let mut ids = Job::list_ids(&self.dirs)?;
        // Numeric IDs in numeric order, then everything else.
        ids.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), id.clone()));
        for id in ids {
            let record = match Job::new(&self.dirs, &id).record() {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!("skipping unreadable job {id}: {err}");
                    continue;
                }
            };
            if record.experiment_id == self.id {
                index.entry(record.job_type).or_default().push(id);
            }
        }
        tracing::info!(experiment = %self.id, "rebuilt jobs index");
        self.write_jobs_index(&index)
    }

    /// The IDs of all jobs in the index, across types.
    pub fn job_ids(&self) -> Result<Vec<String>> {
        Ok(self.jobs_index()?.into_values().flatten().collect())
    }

    /// The records of indexed jobs, optionally restricted to one type and one status.
    pub fn jobs(
        &self,
        job_type: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobRecord>> {
        let index = self.jobs_index()?;
        let ids = index
            .iter()
            .filter(|(ty, _)| job_type.map_or(true, |job_type| job_type == ty.as_str()))
            .flat_map(|(_, ids)| ids);

        let mut jobs = vec![];
        for id in ids {
            let record = match Job::get(&self.dirs, id).and_then(|job| job.record()) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!("indexed job {id} is unreadable: {err}");
                    continue;
                }
            };
            if status.map_or(true, |status| record.status == status) {
                jobs.push(record);
            }
        }
        Ok(jobs)
    }
}
