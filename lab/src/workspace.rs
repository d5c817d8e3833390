//! Locating the Transformer Lab home and workspace directories.
//!
//! The home directory (`TFL_HOME_DIR`, by default `~/.transformerlab`) is the parent of all
//! Transformer Lab data. The workspace directory is where experiments, jobs, models and datasets
//! live. It can be given explicitly with `TFL_WORKSPACE_DIR`; otherwise it is chosen per
//! organization by asking the Transformer Lab API who is logged in, falling back to
//! `<home>/workspace` when nobody is (or the API is unreachable).

use crate::auth::Session;
use crate::error::{Error, Result};
use crate::filename::secure_filename;
use async_trait::async_trait;
use clap::Args;
use derive_more::Into;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the Transformer Lab API is served by default.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8338";

/// How long to wait for the organization lookup before falling back.
const ORG_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Workspace configuration.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// The Transformer Lab home directory [default: ~/.transformerlab].
    ///
    /// If given, the directory must already exist.
    #[clap(long, env = "TFL_HOME_DIR", name = "HOME_DIR")]
    pub home_dir: Option<PathBuf>,

    /// The workspace directory [default: resolved from the logged in organization].
    ///
    /// If given, the directory must already exist.
    #[clap(long, env = "TFL_WORKSPACE_DIR", name = "WORKSPACE_DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Base URL of the Transformer Lab API.
    #[clap(long, env = "TFL_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    pub api_base_url: String,

    /// URI of the storage backend [default: the home directory].
    #[clap(long, env = "TFL_STORAGE_URI", name = "URI")]
    pub storage_uri: Option<String>,

    /// Attach to an existing job instead of creating a new one.
    #[clap(long, env = "_TFL_JOB_ID", name = "JOB_ID")]
    pub job_id: Option<String>,

    /// A Weights & Biases run URL to record on the job.
    #[clap(long, env = "WANDB_URL", name = "URL")]
    pub wandb_url: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            home_dir: None,
            workspace_dir: None,
            api_base_url: DEFAULT_API_BASE_URL.into(),
            storage_uri: None,
            job_id: None,
            wandb_url: None,
        }
    }
}

impl Options {
    /// Read options from the environment, without parsing a command line.
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok().filter(|val| !val.is_empty());
        Self {
            home_dir: var("TFL_HOME_DIR").map(PathBuf::from),
            workspace_dir: var("TFL_WORKSPACE_DIR").map(PathBuf::from),
            api_base_url: var("TFL_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.into()),
            storage_uri: var("TFL_STORAGE_URI"),
            job_id: var("_TFL_JOB_ID"),
            wandb_url: var("WANDB_URL"),
        }
    }

    /// Options for a workspace at explicit, already existing paths.
    pub fn local(home_dir: impl Into<PathBuf>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: Some(home_dir.into()),
            workspace_dir: Some(workspace_dir.into()),
            ..Default::default()
        }
    }
}

/// The parts of the Transformer Lab API needed to resolve a workspace.
#[async_trait]
pub trait AuthApi {
    /// The organization of the logged in user, if any.
    async fn organization_id(&self) -> Result<Option<String>>;
}

/// A client for the Transformer Lab API.
pub struct ApiClient {
    client: surf::Client,
    session: Session,
}

impl ApiClient {
    /// Connect to the API at `base_url`, authenticating with `session`.
    pub fn new(base_url: &str, session: Session) -> Result<Self> {
        let base_url = format!("{}/", base_url.trim_end_matches('/'));
        let base_url: surf::Url = base_url
            .parse()
            .map_err(|err| Error::InvalidArgument(format!("API base URL {base_url}: {err}")))?;
        let client: surf::Client = surf::Config::new()
            .set_base_url(base_url)
            .set_timeout(Some(ORG_LOOKUP_TIMEOUT))
            .try_into()
            .map_err(|err| Error::Http(format!("unable to build HTTP client: {err}")))?;
        Ok(Self { client, session })
    }
}

/// Response from the `/auth/me` endpoint.
#[derive(Clone, Debug, Deserialize, Into)]
struct Me {
    #[serde(default)]
    organization_id: Option<String>,
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn organization_id(&self) -> Result<Option<String>> {
        let mut req = self
            .client
            .get("auth/me")
            .header("Accept", "application/json");
        if let Some(cookies) = self.session.cookie_header() {
            req = req.header("Cookie", cookies);
        }
        let me: Me = req.recv_json().await.map_err(|err| Error::Http(err.to_string()))?;
        Ok(me.into())
    }
}

/// The user's home directory.
fn user_home() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// The Transformer Lab home directory.
///
/// An explicit directory must exist. The default directory is returned whether or not it exists;
/// the caller creates it.
pub fn home_dir(opt: &Options) -> Result<PathBuf> {
    match &opt.home_dir {
        Some(dir) => {
            if !dir.exists() {
                return Err(Error::MissingDirectory {
                    var: "TFL_HOME_DIR",
                    path: dir.clone(),
                });
            }
            tracing::info!("home directory is set to: {}", dir.display());
            Ok(dir.clone())
        }
        None => Ok(user_home().join(".transformerlab")),
    }
}

/// The workspace directory for `home`.
///
/// An explicit directory must exist. Otherwise the organization of the logged in user picks
/// `<home>/orgs/<org>/workspace`, and `<home>/workspace` is used when there is no organization.
pub async fn workspace_dir<A>(opt: &Options, home: &Path, api: &A) -> Result<PathBuf>
where
    A: AuthApi + Sync + ?Sized,
{
    if let Some(dir) = &opt.workspace_dir {
        if !dir.exists() {
            return Err(Error::MissingDirectory {
                var: "TFL_WORKSPACE_DIR",
                path: dir.clone(),
            });
        }
        tracing::info!("workspace is set to: {}", dir.display());
        return Ok(dir.clone());
    }

    let dir = match api.organization_id().await {
        Ok(Some(org)) if !secure_filename(&org).is_empty() => home
            .join("orgs")
            .join(secure_filename(&org))
            .join("workspace"),
        Ok(_) => home.join("workspace"),
        Err(err) => {
            tracing::debug!("organization lookup failed, using default workspace: {err}");
            home.join("workspace")
        }
    };
    tracing::info!("using resolved workspace directory: {}", dir.display());
    Ok(dir)
}
