//! Record the work of plugins and training scripts into a Transformer Lab workspace.
//!
//! A workspace is a directory tree holding experiments, jobs, models, datasets, tasks and config
//! entries. Each of these is a directory with an `index.json` metadata document; see
//! [`resource::LabResource`] for the shared contract. Scripts usually only need the [`Lab`]
//! facade:
//!
//! ```no_run
//! # async fn run() -> lab::Result<()> {
//! let lab = lab::Lab::init(&lab::Options::from_env(), "alpha").await?;
//! lab.log("loading dataset")?;
//! lab.update_progress(50)?;
//! lab.finish("done", None, None, None)?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod dataset;
pub mod dirs;
pub mod error;
pub mod experiment;
pub mod filename;
pub mod job;
pub mod lab;
pub mod model;
pub mod resource;
pub mod storage;
pub mod task;
pub mod workspace;

pub use dirs::Dirs;
pub use error::{Error, Result};
pub use experiment::Experiment;
pub use job::{Job, JobStatus};
pub use lab::Lab;
pub use resource::LabResource;
pub use workspace::Options;

use tracing_subscriber::EnvFilter;

/// Install a stderr `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Calling this more than once is harmless; only the first call installs a subscriber.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// The current time, in the naive UTC form stored in metadata documents.
pub(crate) fn now() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}
