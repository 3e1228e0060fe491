//! YAML job configuration.
//!
//! A job config names the repository, the good/bad boundary commits, the
//! ports the service under bisection listens on, its healthchecks, and the
//! recipe for building a runnable image. Decode failures and missing
//! required fields are fatal before a job starts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::errors::DriverError;
use crate::healthcheck::Healthcheck;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub repository: String,

    pub good_commit: String,
    pub bad_commit: String,

    /// Exit code by which a script healthcheck declares the commit
    /// untestable outright. 0 disables the shortcut.
    #[serde(default)]
    pub error_exit_code: i32,

    #[serde(default)]
    pub port: Option<u16>,
    /// Wins over `port` when both are present.
    #[serde(default)]
    pub ports: Vec<u16>,

    #[serde(default)]
    pub healthcheck: Vec<Healthcheck>,

    /// Inline Dockerfile text. Wins over both path variants.
    #[serde(default)]
    pub dockerfile: Option<String>,
    /// Path to a Dockerfile outside the repository, relative to the current
    /// working directory.
    #[serde(default)]
    pub dockerfile_path: Option<PathBuf>,
    /// Path to a Dockerfile inside the repository, relative to the project
    /// root. Read from each working tree, since its content can change from
    /// commit to commit.
    #[serde(default)]
    pub dockerfile_path_relative: Option<PathBuf>,

    /// Informational; not used by the bisection engine.
    #[serde(default)]
    pub build_cost: f64,
}

impl JobConfig {
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        serde_yaml::from_reader(reader).context("Failed to decode job configuration")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open job configuration at {}", path.display()))?;
        Self::from_reader(file)
    }

    /// The effective port set: `ports` wins, a lone `port` is promoted to a
    /// one-element set.
    pub fn ports(&self) -> Vec<u16> {
        if !self.ports.is_empty() {
            self.ports.clone()
        } else {
            self.port.into_iter().collect()
        }
    }

    /// Resolve which Dockerfile recipe applies: inline text wins, then
    /// `dockerfilePath`, then `dockerfilePathRelative`.
    pub fn dockerfile_source(&self) -> Result<DockerfileSource> {
        if let Some(text) = &self.dockerfile {
            return Ok(DockerfileSource::Inline(text.clone()));
        }
        if let Some(path) = &self.dockerfile_path {
            return Ok(DockerfileSource::Path(path.clone()));
        }
        if let Some(path) = &self.dockerfile_path_relative {
            return Ok(DockerfileSource::ProjectRelative(path.clone()));
        }
        anyhow::bail!("Job configuration has no dockerfile, dockerfilePath or dockerfilePathRelative")
    }
}

/// Where the Dockerfile text for a build comes from.
#[derive(Debug, Clone)]
pub enum DockerfileSource {
    Inline(String),
    Path(PathBuf),
    ProjectRelative(PathBuf),
}

impl DockerfileSource {
    /// Materialise the Dockerfile text for one working tree. A missing
    /// project-relative Dockerfile is a property of the commit (it may
    /// predate the file) and therefore a build failure, not a fatal error.
    pub(crate) async fn resolve(&self, worktree: &Path) -> Result<String, DriverError> {
        match self {
            DockerfileSource::Inline(text) => Ok(text.clone()),
            DockerfileSource::Path(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                DriverError::Other(anyhow::anyhow!(
                    "Failed to read Dockerfile at {}: {}",
                    path.display(),
                    e
                ))
            }),
            DockerfileSource::ProjectRelative(path) => {
                tokio::fs::read_to_string(worktree.join(path)).await.map_err(|e| {
                    DriverError::BuildFailed(format!(
                        "no Dockerfile at {} in this commit: {}",
                        path.display(),
                        e
                    ))
                })
            }
        }
    }
}
