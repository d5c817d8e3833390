//! The directory layout of a workspace.
//!
//! ```text
//! <home>/
//!     logs/
//!     <workspace>/
//!         experiments/<name>/{index.json, jobs.json, jobs/, evals/, generations/}
//!         jobs/<id>/{index.json, output_<id>.txt, artifacts/, checkpoints/}
//!         models/  datasets/  tasks/  config/
//!         temp/  prompt_templates/  tools/  batched_prompts/  galleries/
//!         plugins/
//!         transformerlab.log
//! ```

use crate::auth::Session;
use crate::error::Result;
use crate::filename::secure_filename;
use crate::storage::{self, DebugInfo, Storage};
use crate::workspace::{self, ApiClient, AuthApi, Options};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const EXPERIMENTS: &str = "experiments";
const JOBS: &str = "jobs";
const MODELS: &str = "models";
const DATASETS: &str = "datasets";
const TASKS: &str = "tasks";
const CONFIG: &str = "config";
const TEMP: &str = "temp";
const PROMPT_TEMPLATES: &str = "prompt_templates";
const TOOLS: &str = "tools";
const BATCHED_PROMPTS: &str = "batched_prompts";
const GALLERIES: &str = "galleries";
const PLUGINS: &str = "plugins";
const LOGS: &str = "logs";

/// Workspace subdirectories created when a workspace is opened.
const CREATED: &[&str] = &[
    EXPERIMENTS,
    JOBS,
    MODELS,
    DATASETS,
    TASKS,
    CONFIG,
    TEMP,
    PROMPT_TEMPLATES,
    TOOLS,
    BATCHED_PROMPTS,
    GALLERIES,
];

/// An open workspace: its location and the storage it lives in.
#[derive(Clone, Debug)]
pub struct Dirs {
    home: PathBuf,
    workspace: PathBuf,
    storage: Arc<dyn Storage>,
    storage_uri: Option<String>,
}

impl Dirs {
    /// Resolve and open the workspace described by `opt`.
    pub async fn open(opt: &Options) -> Result<Self> {
        let api = ApiClient::new(&opt.api_base_url, Session::default())?;
        Self::open_with(opt, &api).await
    }

    /// Resolve and open a workspace, using `api` to look up the current organization.
    pub async fn open_with<A>(opt: &Options, api: &A) -> Result<Self>
    where
        A: AuthApi + Sync + ?Sized,
    {
        let home = workspace::home_dir(opt)?;
        let storage = storage::open(opt.storage_uri.as_deref(), &home)?;
        storage.create_dir_all(&home)?;
        let workspace = workspace::workspace_dir(opt, &home, api).await?;
        let mut dirs = Self::at(home, workspace, storage)?;
        dirs.storage_uri = opt.storage_uri.clone();
        Ok(dirs)
    }

    /// Open a workspace at known paths, creating the standard layout.
    pub fn at(
        home: impl Into<PathBuf>,
        workspace: impl Into<PathBuf>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let dirs = Self {
            home: home.into(),
            workspace: workspace.into(),
            storage,
            storage_uri: None,
        };
        dirs.storage.create_dir_all(&dirs.workspace)?;
        for name in CREATED {
            dirs.storage.create_dir_all(&dirs.workspace.join(name))?;
        }
        dirs.storage.create_dir_all(&dirs.logs_dir())?;
        Ok(dirs)
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn debug_info(&self) -> DebugInfo {
        DebugInfo::new(self.storage(), self.storage_uri.as_deref())
    }

    pub fn home_dir(&self) -> &Path {
        &self.home
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace
    }

    pub fn experiments_dir(&self) -> PathBuf {
        self.workspace.join(EXPERIMENTS)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.workspace.join(JOBS)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.workspace.join(MODELS)
    }

    pub fn datasets_dir(&self) -> PathBuf {
        self.workspace.join(DATASETS)
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.workspace.join(TASKS)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.workspace.join(CONFIG)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.workspace.join(TEMP)
    }

    pub fn prompt_templates_dir(&self) -> PathBuf {
        self.workspace.join(PROMPT_TEMPLATES)
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.workspace.join(TOOLS)
    }

    pub fn batched_prompts_dir(&self) -> PathBuf {
        self.workspace.join(BATCHED_PROMPTS)
    }

    pub fn galleries_cache_dir(&self) -> PathBuf {
        self.workspace.join(GALLERIES)
    }

    /// Where plugins are installed. Not created automatically.
    pub fn plugins_dir(&self) -> PathBuf {
        self.workspace.join(PLUGINS)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join(LOGS)
    }

    /// The application-wide log file.
    pub fn global_log_path(&self) -> PathBuf {
        self.workspace.join("transformerlab.log")
    }

    pub fn experiment_dir_by_name(&self, experiment: &str) -> PathBuf {
        self.experiments_dir().join(experiment)
    }

    pub fn plugin_dir_by_name(&self, plugin: &str) -> PathBuf {
        self.plugins_dir().join(secure_filename(plugin))
    }

    pub fn dataset_dir_by_id(&self, dataset: &str) -> PathBuf {
        self.datasets_dir().join(dataset)
    }

    /// The output directory of a job within its experiment, created if necessary.
    pub fn job_dir_by_experiment_and_id(&self, experiment: &str, job: &str) -> Result<PathBuf> {
        let dir = self.experiment_dir_by_name(experiment).join(JOBS).join(job);
        self.storage.create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Where a job writes its outputs, created if necessary.
    pub fn job_output_dir(&self, experiment: &str, job: &str) -> Result<PathBuf> {
        self.job_dir_by_experiment_and_id(experiment, job)
    }

    pub fn job_artifacts_dir(&self, job: &str) -> PathBuf {
        self.jobs_dir().join(job).join("artifacts")
    }

    pub fn job_checkpoints_dir(&self, job: &str) -> PathBuf {
        self.jobs_dir().join(job).join("checkpoints")
    }

    /// The output file of an evaluation run in `experiment`. Its parent is created.
    pub fn eval_output_file(&self, experiment: &str, eval: &str) -> Result<PathBuf> {
        self.named_output_file(experiment, "evals", eval)
    }

    /// The output file of a generation run in `experiment`. Its parent is created.
    pub fn generation_output_file(&self, experiment: &str, generation: &str) -> Result<PathBuf> {
        self.named_output_file(experiment, "generations", generation)
    }

    fn named_output_file(&self, experiment: &str, kind: &str, name: &str) -> Result<PathBuf> {
        let dir = self
            .experiment_dir_by_name(experiment)
            .join(kind)
            .join(secure_filename(name));
        self.storage.create_dir_all(&dir)?;
        Ok(dir.join("output.txt"))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::storage::LocalStorage;
    use crate::workspace::test::FixedOrg;
    use std::fs;
    use tempfile::TempDir;

    /// A fresh workspace in a temporary directory.
    pub(crate) fn scratch() -> (TempDir, Dirs) {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join(".tfl_home");
        let dirs = Dirs::at(
            &home,
            tmp.path().join(".tfl_ws"),
            Arc::new(LocalStorage::new(&home)),
        )
        .unwrap();
        (tmp, dirs)
    }

    #[test]
    fn test_structure_created() {
        let (_tmp, dirs) = scratch();
        for dir in [
            dirs.experiments_dir(),
            dirs.jobs_dir(),
            dirs.models_dir(),
            dirs.datasets_dir(),
            dirs.tasks_dir(),
            dirs.config_dir(),
            dirs.temp_dir(),
            dirs.prompt_templates_dir(),
            dirs.tools_dir(),
            dirs.batched_prompts_dir(),
            dirs.galleries_cache_dir(),
            dirs.logs_dir(),
        ] {
            assert!(dir.is_dir(), "{}", dir.display());
        }
        assert!(!dirs.plugins_dir().exists());
    }

    #[test]
    fn test_experiment_and_job_helpers() {
        let (_tmp, dirs) = scratch();

        assert!(dirs
            .experiment_dir_by_name("My Exp")
            .ends_with("experiments/My Exp"));

        let job_dir = dirs.job_dir_by_experiment_and_id("My Exp", "001").unwrap();
        assert!(job_dir.is_dir());
        assert!(job_dir.ends_with("experiments/My Exp/jobs/001"));
        assert_eq!(dirs.job_output_dir("My Exp", "001").unwrap(), job_dir);

        assert!(dirs.job_artifacts_dir("7").ends_with("jobs/7/artifacts"));
        assert!(dirs.job_checkpoints_dir("7").ends_with("jobs/7/checkpoints"));
        assert!(dirs
            .plugin_dir_by_name("../evil plugin")
            .ends_with("plugins/evil_plugin"));
    }

    #[test]
    fn test_output_files() {
        let (_tmp, dirs) = scratch();
        let eval = dirs.eval_output_file("exp", "my eval/1").unwrap();
        assert!(eval.ends_with("experiments/exp/evals/my_eval_1/output.txt"));
        assert!(eval.parent().unwrap().is_dir());

        let generation = dirs.generation_output_file("exp", "gen").unwrap();
        assert!(generation.ends_with("experiments/exp/generations/gen/output.txt"));
    }

    #[async_std::test]
    async fn test_open_with_env_overrides() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("custom_home");
        let ws = tmp.path().join("custom_ws");
        fs::create_dir(&home).unwrap();
        fs::create_dir(&ws).unwrap();

        let dirs = Dirs::open_with(&Options::local(&home, &ws), &FixedOrg(Some("acme")))
            .await
            .unwrap();
        assert_eq!(dirs.home_dir(), home);
        assert_eq!(dirs.workspace_dir(), ws);
        assert!(dirs.jobs_dir().is_dir());
        assert_eq!(dirs.debug_info().filesystem_type, "local");
    }

    #[async_std::test]
    async fn test_open_with_org_workspace() {
        let tmp = TempDir::new().unwrap();
        let opt = Options {
            home_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let dirs = Dirs::open_with(&opt, &FixedOrg(Some("acme"))).await.unwrap();
        assert_eq!(dirs.workspace_dir(), tmp.path().join("orgs/acme/workspace"));
        assert!(dirs.experiments_dir().is_dir());
    }
}
