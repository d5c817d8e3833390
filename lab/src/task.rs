//! Task templates: reusable plugin invocations, optionally tied to an experiment.

use crate::dirs::Dirs;
use crate::error::Result;
use crate::experiment::Experiment;
use crate::filename::secure_filename;
use crate::resource::{lenient_id, LabResource};
use chrono::NaiveDateTime;
use serde::{de::Deserializer, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// The metadata document of a task.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TaskRecord {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub outputs: Value,
    /// The experiment this task belongs to, by name.
    #[serde(default, deserialize_with = "lenient_opt_id")]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub remote_task: bool,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient_opt_id<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    let id = lenient_id(d)?;
    Ok(if id.is_empty() { None } else { Some(id) })
}

/// Changes to task metadata. Fields left as [`None`] are not changed.
#[derive(Clone, Debug, Default)]
pub struct TaskMetadata {
    pub name: Option<String>,
    pub task_type: Option<String>,
    pub inputs: Option<Value>,
    pub config: Option<Value>,
    pub plugin: Option<String>,
    pub outputs: Option<Value>,
    pub experiment_id: Option<String>,
    pub remote_task: Option<bool>,
}

/// A task in the workspace.
#[derive(Clone, Debug)]
pub struct Task {
    dirs: Dirs,
    id: String,
}

impl LabResource for Task {
    const KIND: &'static str = "task";
    type Record = TaskRecord;

    fn root(dirs: &Dirs) -> PathBuf {
        dirs.tasks_dir()
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

    fn default_record(&self) -> TaskRecord {
        let now = crate::now();
        TaskRecord {
            id: self.id.clone(),
            name: String::new(),
            task_type: String::new(),
            inputs: Value::Object(Map::new()),
            config: Value::Object(Map::new()),
            plugin: String::new(),
            outputs: Value::Object(Map::new()),
            experiment_id: None,
            remote_task: false,
            created_at: Some(now),
            updated_at: Some(now),
            extra: Map::new(),
        }
    }
}

impl Task {
    /// Apply `metadata` and bump `updated_at`, even if nothing else changed.
    pub fn set_metadata(&self, metadata: TaskMetadata) -> Result<()> {
        self.update(|record| {
            let TaskMetadata {
                name,
                task_type,
                inputs,
                config,
                plugin,
                outputs,
                experiment_id,
                remote_task,
            } = metadata;
            if let Some(name) = name {
                record.name = name;
            }
            if let Some(task_type) = task_type {
                record.task_type = task_type;
            }
            if let Some(inputs) = inputs {
                record.inputs = inputs;
            }
            if let Some(config) = config {
                record.config = config;
            }
            if let Some(plugin) = plugin {
                record.plugin = plugin;
            }
            if let Some(outputs) = outputs {
                record.outputs = outputs;
            }
            if experiment_id.is_some() {
                record.experiment_id = experiment_id;
            }
            if let Some(remote_task) = remote_task {
                record.remote_task = remote_task;
            }
            record.updated_at = Some(crate::now());
        })
    }

    /// The task metadata.
    ///
    /// Older tasks refer to their experiment by database ID. If `experiment_id` is numeric and an
    /// experiment with that `db_experiment_id` exists, it is replaced by the experiment name and the
    /// corrected document is saved.
    pub fn metadata(&self) -> Result<TaskRecord> {
        let mut record = self.record()?;
        let Some(db_id) = record
            .experiment_id
            .as_deref()
            .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|id| id.parse::<i64>().ok())
        else {
            return Ok(record);
        };
        if let Some(name) = experiment_name_by_db_id(&self.dirs, db_id) {
            tracing::debug!(task = %self.id, "experiment {db_id} is {name}");
            record.experiment_id = Some(name);
            self.set_record(&record)?;
        }
        Ok(record)
    }

    /// All readable tasks, newest first.
    pub fn list_all(dirs: &Dirs) -> Result<Vec<TaskRecord>> {
        let mut tasks = vec![];
        for id in Self::list_ids(dirs)? {
            match Self::new(dirs, &id).metadata() {
                Ok(record) => tasks.push(record),
                Err(err) => tracing::warn!("skipping unreadable task {id}: {err}"),
            }
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    pub fn list_by_type(dirs: &Dirs, task_type: &str) -> Result<Vec<TaskRecord>> {
        Self::list_where(dirs, |task| task.task_type == task_type)
    }

    pub fn list_by_experiment(dirs: &Dirs, experiment: &str) -> Result<Vec<TaskRecord>> {
        Self::list_where(dirs, |task| task.experiment_id.as_deref() == Some(experiment))
    }

    pub fn list_by_type_in_experiment(
        dirs: &Dirs,
        task_type: &str,
        experiment: &str,
    ) -> Result<Vec<TaskRecord>> {
        Self::list_where(dirs, |task| {
            task.task_type == task_type && task.experiment_id.as_deref() == Some(experiment)
        })
    }

    fn list_where(dirs: &Dirs, f: impl Fn(&TaskRecord) -> bool) -> Result<Vec<TaskRecord>> {
        Ok(Self::list_all(dirs)?.into_iter().filter(f).collect())
    }

    /// The metadata of task `id`, or [`None`] if there is no such task.
    pub fn get_by_id(dirs: &Dirs, id: &str) -> Result<Option<TaskRecord>> {
        match Self::get(dirs, id) {
            Ok(task) => Ok(Some(task.metadata()?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Remove every task in the workspace.
    pub fn delete_all(dirs: &Dirs) -> Result<()> {
        for id in Self::list_ids(dirs)? {
            Self::new(dirs, &id).delete()?;
        }
        Ok(())
    }
}

fn experiment_name_by_db_id(dirs: &Dirs, db_id: i64) -> Option<String> {
    let experiments = match Experiment::list_all(dirs) {
        Ok(experiments) => experiments,
        Err(err) => {
            tracing::warn!("unable to list experiments: {err}");
            return None;
        }
    };
    experiments
        .into_iter()
        .find(|exp| exp.db_experiment_id == Some(db_id))
        .map(|exp| exp.name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dirs::test::scratch;
    use serde_json::json;

    fn task(dirs: &Dirs, id: &str, task_type: &str, experiment: &str) -> Task {
        let task = Task::create(dirs, id).unwrap();
        task.set_metadata(TaskMetadata {
            name: Some(id.into()),
            task_type: Some(task_type.into()),
            experiment_id: Some(experiment.into()),
            ..Default::default()
        })
        .unwrap();
        task
    }

    #[test]
    fn test_set_metadata() {
        let (_tmp, dirs) = scratch();
        let t = Task::create(&dirs, "t1").unwrap();
        let before = t.metadata().unwrap();
        assert_eq!(before.experiment_id, None);
        assert_eq!(before.inputs, json!({}));

        t.set_metadata(TaskMetadata {
            plugin: Some("llama_trainer".into()),
            config: Some(json!({"epochs": 3})),
            remote_task: Some(true),
            ..Default::default()
        })
        .unwrap();
        let after = t.metadata().unwrap();
        assert_eq!(after.plugin, "llama_trainer");
        assert_eq!(after.config, json!({"epochs": 3}));
        assert!(after.remote_task);
        assert_eq!(after.name, "");
        assert!(after.updated_at >= before.updated_at);
    }

    #[test]
    fn test_listing() {
        let (_tmp, dirs) = scratch();
        task(&dirs, "a", "TRAIN", "alpha");
        task(&dirs, "b", "EVAL", "alpha");
        task(&dirs, "c", "TRAIN", "beta");

        assert_eq!(Task::list_all(&dirs).unwrap().len(), 3);
        assert_eq!(Task::list_by_type(&dirs, "TRAIN").unwrap().len(), 2);
        assert_eq!(Task::list_by_experiment(&dirs, "alpha").unwrap().len(), 2);
        let found = Task::list_by_type_in_experiment(&dirs, "TRAIN", "beta").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "c");

        assert_eq!(Task::get_by_id(&dirs, "b").unwrap().unwrap().task_type, "EVAL");
        assert_eq!(Task::get_by_id(&dirs, "zzz").unwrap(), None);

        Task::delete_all(&dirs).unwrap();
        assert!(Task::list_all(&dirs).unwrap().is_empty());
    }

    #[test]
    fn test_numeric_experiment_id_is_resolved() {
        let (_tmp, dirs) = scratch();
        let exp = Experiment::create(&dirs, "alpha").unwrap();
        exp.update(|record| record.db_experiment_id = Some(7)).unwrap();

        let t = Task::create(&dirs, "legacy").unwrap();
        dirs.storage()
            .write(
                &t.index_path(),
                json!({"id": "legacy", "experiment_id": 7, "type": "TRAIN"})
                    .to_string()
                    .as_bytes(),
            )
            .unwrap();

        assert_eq!(t.metadata().unwrap().experiment_id.as_deref(), Some("alpha"));
        // The correction is persisted.
        assert_eq!(t.record().unwrap().experiment_id.as_deref(), Some("alpha"));

        // Unknown database IDs are left alone.
        t.set_metadata(TaskMetadata {
            experiment_id: Some("99".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(t.metadata().unwrap().experiment_id.as_deref(), Some("99"));
    }
}
