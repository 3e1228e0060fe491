//! Job coordination: one job bisects one repository with N concurrent
//! replicas, each hunting a different issue.
//!
//! `run` clones the repository, linearises the commit range, opens the
//! broken-commit registry and starts the replicas; the two returned channels
//! carry systems ready to be judged and converged offending commits. `stop`
//! tears everything down. `run_commit_by_offset` runs one arbitrary commit
//! outside any bisection.

pub mod replacements;
mod replica;
pub mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{DockerfileSource, JobConfig};
use crate::docker::{ContainerDriver, DockerDriver};
use crate::errors::JobError;
use crate::healthcheck::{Healthcheck, run_healthchecks};
use replacements::CommitReplacements;
use replica::{Replica, launch_commit};
use snapshot::{CommitIndex, RepoSnapshot};

pub use replica::{OffendingCommit, RunningSystem, Verdict};

/// State shared between a job and its replicas. Replicas hold a non-owning
/// `Arc`; the job drops its copy at stop.
pub(crate) struct JobShared {
    pub(crate) index: CommitIndex,
    pub(crate) repo_path: PathBuf,
    pub(crate) registry: CommitReplacements,
    pub(crate) driver: Arc<dyn ContainerDriver>,
    pub(crate) dockerfile: DockerfileSource,
    pub(crate) ports: Vec<u16>,
    pub(crate) healthchecks: Vec<Healthcheck>,
    pub(crate) error_exit_code: i32,
}

struct ReplicaHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

/// A blueprint for replicas plus their shared resources once running.
pub struct Job {
    /// How many replicas to spawn; each bisects one issue.
    pub replicas_count: usize,

    pub repository: String,
    pub good_commit: String,
    pub bad_commit: String,

    pub ports: Vec<u16>,
    pub healthchecks: Vec<Healthcheck>,
    pub dockerfile: DockerfileSource,

    /// Exit code by which a script healthcheck declares a commit untestable.
    pub error_exit_code: i32,
    /// Informational; carried from the config but not consulted by the
    /// bisection engine.
    pub build_cost: f64,

    /// Append-only backup of the broken-commit registry.
    pub replacements_backup: PathBuf,

    driver: Option<Arc<dyn ContainerDriver>>,
    snapshot: Option<RepoSnapshot>,
    shared: Option<Arc<JobShared>>,
    replicas: Vec<ReplicaHandle>,
}

impl Job {
    /// Build a job from a decoded configuration. The replica count and the
    /// registry backup path are runtime concerns, set by the caller before
    /// `run`.
    pub fn from_config(config: JobConfig) -> Result<Self> {
        let dockerfile = config.dockerfile_source()?;
        Ok(Self {
            replicas_count: 0,
            repository: config.repository.clone(),
            good_commit: config.good_commit.clone(),
            bad_commit: config.bad_commit.clone(),
            ports: config.ports(),
            healthchecks: config.healthcheck.clone(),
            dockerfile,
            error_exit_code: config.error_exit_code,
            build_cost: config.build_cost,
            replacements_backup: PathBuf::from("replacements.log"),
            driver: None,
            snapshot: None,
            shared: None,
            replicas: Vec::new(),
        })
    }

    /// Use a specific container driver instead of connecting to the local
    /// Docker daemon at `run`.
    pub fn with_driver(mut self, driver: Arc<dyn ContainerDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Clone the repository, enumerate the candidate commits and start all
    /// replicas. Returns one receiver for systems awaiting a verdict and one
    /// for converged offending commits; once an offending commit for a
    /// replica arrives, that replica emits no further systems.
    pub async fn run(
        &mut self,
    ) -> Result<(mpsc::Receiver<RunningSystem>, mpsc::Receiver<OffendingCommit>)> {
        let driver: Arc<dyn ContainerDriver> = match &self.driver {
            Some(driver) => driver.clone(),
            None => Arc::new(DockerDriver::connect().await?),
        };

        let snapshot = RepoSnapshot::clone_from(&self.repository)?;
        let index = snapshot.enumerate(&self.good_commit, &self.bad_commit)?;
        eprintln!(
            "[job] {} candidate commits between {} (bad) and {} (good)",
            index.len(),
            self.bad_commit,
            self.good_commit
        );

        let registry = CommitReplacements::open(&self.replacements_backup)?;

        // Bounded so replicas block rather than overwhelm a slow judge.
        let capacity = self.replicas_count.max(1);
        let (rs_tx, rs_rx) = mpsc::channel(capacity);
        let (oc_tx, oc_rx) = mpsc::channel(capacity);

        let shared = Arc::new(JobShared {
            index,
            repo_path: snapshot.path().to_path_buf(),
            registry,
            driver,
            dockerfile: self.dockerfile.clone(),
            ports: self.ports.clone(),
            healthchecks: self.healthchecks.clone(),
            error_exit_code: self.error_exit_code,
        });
        self.snapshot = Some(snapshot);
        self.shared = Some(shared.clone());

        for i in 0..self.replicas_count {
            let replica = Replica::new(shared.clone(), i);
            let (stop_tx, stop_rx) = oneshot::channel();
            let task = tokio::spawn(replica.run(rs_tx.clone(), oc_tx.clone(), stop_rx));
            self.replicas.push(ReplicaHandle { stop_tx: Some(stop_tx), task });
        }

        Ok((rs_rx, oc_rx))
    }

    /// Stop all replicas, tear down any live containers and remove the
    /// snapshot directory. Idempotent. Pending verdict handles held by
    /// clients become no-ops.
    pub async fn stop(&mut self) -> Result<()> {
        for handle in &mut self.replicas {
            if let Some(stop_tx) = handle.stop_tx.take() {
                let _ = stop_tx.send(());
            }
        }

        let mut failed = 0;
        for handle in self.replicas.drain(..) {
            match handle.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    eprintln!("[job] replica failed: {:#}", e);
                    failed += 1;
                }
                Err(e) => {
                    eprintln!("[job] replica task panicked: {}", e);
                    failed += 1;
                }
            }
        }

        self.shared = None;
        self.snapshot = None;

        if failed > 0 {
            return Err(JobError::ReplicasFailed { failed }.into());
        }
        Ok(())
    }

    /// Run one commit by its offset behind the bad commit, outside any
    /// bisection. Requires `run` to have initialised the commit index. The
    /// returned system is released (container stopped) by `done`, by any
    /// verdict call, or by dropping every handle.
    pub async fn run_commit_by_offset(&self, offset: usize) -> Result<RunningSystem> {
        let shared = self.shared.as_ref().ok_or(JobError::NotInitialized)?;
        if offset >= shared.index.len() {
            return Err(JobError::OffsetOutOfRange { offset, count: shared.index.len() }.into());
        }

        let container = launch_commit(shared, offset)
            .await
            .with_context(|| format!("Failed to run commit at offset {}", offset))?;

        if let Err(e) = run_healthchecks(
            shared.driver.as_ref(),
            &container,
            &shared.healthchecks,
            shared.error_exit_code,
        )
        .await
        {
            let _ = shared.driver.stop(&container.id).await;
            return Err(anyhow::Error::from(e)
                .context(format!("Commit at offset {} never became healthy", offset)));
        }

        let (system, release_rx) = RunningSystem::new(None, offset, container.ports.clone());
        let driver = shared.driver.clone();
        let container_id = container.id;
        tokio::spawn(async move {
            // Any report, or every handle dropping, releases the container.
            let _ = release_rx.await;
            if let Err(e) = driver.stop(&container_id).await {
                eprintln!("[job] failed to stop ad-hoc container {}: {}", container_id, e);
            }
        });

        Ok(system)
    }
}
