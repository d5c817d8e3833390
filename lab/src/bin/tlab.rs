use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use lab::{
    config::Config, dataset::Dataset, init_logging, model::Model, task::Task, Dirs, Experiment,
    Job, JobStatus, LabResource, Options,
};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// Inspect and manage a Transformer Lab workspace.
///
/// Results are written to stdout as JSON.
#[derive(Parser)]
struct Cli {
    #[clap(flatten)]
    opt: Options,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show where the workspace is and how it is stored.
    Info,
    /// Manage experiments.
    #[clap(subcommand)]
    Experiment(ExperimentCommand),
    /// Inspect and control jobs.
    #[clap(subcommand)]
    Job(JobCommand),
    /// Inspect models.
    #[clap(subcommand)]
    Model(ListCommand),
    /// Inspect datasets.
    #[clap(subcommand)]
    Dataset(ListCommand),
    /// Inspect tasks.
    #[clap(subcommand)]
    Task(TaskCommand),
    /// Read and write workspace settings.
    #[clap(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ExperimentCommand {
    /// List all experiments.
    List,
    /// Create an experiment.
    Create { name: String },
    /// List the jobs of an experiment.
    Jobs {
        name: String,

        /// Only list jobs of this type.
        #[clap(short = 't', long = "type")]
        job_type: Option<String>,

        /// Only list jobs with this status.
        #[clap(short, long)]
        status: Option<JobStatus>,
    },
    /// Rebuild the jobs index of an experiment by scanning all jobs.
    Reindex { name: String },
}

#[derive(Subcommand)]
enum JobCommand {
    /// Show the full metadata of a job.
    Show { id: String },
    /// Show the status of a job.
    Status { id: String },
    /// Ask a running job to stop.
    Stop { id: String },
}

#[derive(Subcommand)]
enum ListCommand {
    /// List everything of this kind in the workspace.
    List,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// List tasks, newest first.
    List {
        /// Only list tasks of this type.
        #[clap(short = 't', long = "type")]
        task_type: Option<String>,

        /// Only list tasks in this experiment.
        #[clap(short, long)]
        experiment: Option<String>,
    },
    /// Show one task.
    Show { id: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the value of a setting, or null if it is not set.
    Get { key: String },
    /// Set a setting. VALUE is parsed as JSON if possible, and stored as a string otherwise.
    Set { key: String, value: String },
}

/// Output of `tlab info`.
#[derive(Serialize)]
struct Info<'a, S: Serialize> {
    home_dir: &'a Path,
    workspace_dir: &'a Path,
    storage: S,
}

fn print(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[async_std::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging();

    let cli = Cli::parse();
    let dirs = Dirs::open(&cli.opt)
        .await
        .context("unable to open workspace")?;

    match cli.command {
        Command::Info => print(&Info {
            home_dir: dirs.home_dir(),
            workspace_dir: dirs.workspace_dir(),
            storage: dirs.debug_info(),
        })?,
        Command::Experiment(ExperimentCommand::List) => print(&Experiment::list_all(&dirs)?)?,
        Command::Experiment(ExperimentCommand::Create { name }) => {
            let exp = Experiment::create(&dirs, &name)?;
            tracing::info!("created experiment {name}");
            print(&exp.record()?)?;
        }
        Command::Experiment(ExperimentCommand::Jobs {
            name,
            job_type,
            status,
        }) => {
            let exp = Experiment::get(&dirs, &name)?;
            print(&exp.jobs(job_type.as_deref(), status)?)?;
        }
        Command::Experiment(ExperimentCommand::Reindex { name }) => {
            let exp = Experiment::get(&dirs, &name)?;
            exp.rebuild_jobs_index()?;
            print(&exp.jobs_index()?)?;
        }
        Command::Job(JobCommand::Show { id }) => print(&Job::get(&dirs, &id)?.record()?)?,
        Command::Job(JobCommand::Status { id }) => {
            print(&Job::get(&dirs, &id)?.status()?)?;
        }
        Command::Job(JobCommand::Stop { id }) => {
            let job = Job::get(&dirs, &id)?;
            let status = job.status()?;
            if status != JobStatus::Running {
                bail!("job {id} is {status}, not running");
            }
            job.request_stop()?;
            tracing::info!("requested stop of job {id}");
        }
        Command::Model(ListCommand::List) => print(&Model::list_all(&dirs)?)?,
        Command::Dataset(ListCommand::List) => print(&Dataset::list_all(&dirs)?)?,
        Command::Task(TaskCommand::List {
            task_type,
            experiment,
        }) => {
            let tasks = match (task_type, experiment) {
                (Some(ty), Some(exp)) => Task::list_by_type_in_experiment(&dirs, &ty, &exp)?,
                (Some(ty), None) => Task::list_by_type(&dirs, &ty)?,
                (None, Some(exp)) => Task::list_by_experiment(&dirs, &exp)?,
                (None, None) => Task::list_all(&dirs)?,
            };
            print(&tasks)?;
        }
        Command::Task(TaskCommand::Show { id }) => match Task::get_by_id(&dirs, &id)? {
            Some(task) => print(&task)?,
            None => bail!("task {id} not found"),
        },
        Command::Config(ConfigCommand::Get { key }) => {
            print(&Config::value_by_key(&dirs, &key)?.unwrap_or(Value::Null))?
        }
        Command::Config(ConfigCommand::Set { key, value }) => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            Config::set_value_by_key(&dirs, &key, value)?;
        }
    }

    Ok(())
}
