//! Per-replica bisection state machine.
//!
//! A replica owns a shrinking interval `[lo, hi]` over the commit index:
//! `lo` is the newest commit known bad, `hi` the oldest known good. Each
//! round it tests the midpoint (resolved through the broken-commit registry),
//! publishes the healthy container as a [`RunningSystem`] and blocks until
//! the external judge answers. Unbuildable or unhealthy commits are marked
//! broken and skipped. When the interval collapses, the replica emits an
//! [`OffendingCommit`] and exits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::docker::{RunningContainer, image_ref};
use crate::errors::{DriverError, HealthcheckError};
use crate::healthcheck::run_healthchecks;
use crate::job::JobShared;
use crate::job::snapshot::checkout_worktree;

/// The judge's classification of one candidate commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The issue does not reproduce on this commit.
    Good,
    /// The issue reproduces on this commit.
    Bad,
    /// The commit cannot be judged; skip it.
    Broken,
}

/// What came back through a [`RunningSystem`] handle.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Report {
    Verdict(Verdict),
    /// Released without a verdict.
    Done,
}

/// A healthy container awaiting the judge's verdict.
///
/// The verdict slot is single-shot: the first of `is_good` / `is_bad` /
/// `is_broken` / `done` wins and every later call on this handle (or on a
/// clone of it) is a no-op. Handles kept across a job stop are likewise
/// no-ops.
#[derive(Debug, Clone)]
pub struct RunningSystem {
    /// Index of the replica this system belongs to; `None` for ad-hoc runs.
    pub replica_index: Option<usize>,
    /// The candidate's offset behind the bad commit.
    pub commit_offset: usize,
    /// Container port → host port.
    pub ports: HashMap<u16, u16>,
    reporter: Arc<Mutex<Option<oneshot::Sender<Report>>>>,
}

impl RunningSystem {
    pub(crate) fn new(
        replica_index: Option<usize>,
        commit_offset: usize,
        ports: HashMap<u16, u16>,
    ) -> (Self, oneshot::Receiver<Report>) {
        let (tx, rx) = oneshot::channel();
        let system = Self {
            replica_index,
            commit_offset,
            ports,
            reporter: Arc::new(Mutex::new(Some(tx))),
        };
        (system, rx)
    }

    pub fn is_good(&self) {
        self.report(Report::Verdict(Verdict::Good));
    }

    pub fn is_bad(&self) {
        self.report(Report::Verdict(Verdict::Bad));
    }

    pub fn is_broken(&self) {
        self.report(Report::Verdict(Verdict::Broken));
    }

    /// Release the system without a verdict.
    pub fn done(&self) {
        self.report(Report::Done);
    }

    fn report(&self, report: Report) {
        let sender = self.reporter.lock().expect("reporter lock poisoned").take();
        if let Some(tx) = sender {
            // The replica may already be gone; a stale handle is a no-op.
            let _ = tx.send(report);
        }
    }
}

/// A replica's final answer: the earliest commit believed to contain the
/// regression, plus the neighbours the bisection could not rule out because
/// they were skipped as broken.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OffendingCommit {
    pub replica_index: usize,
    pub commit: String,
    pub commit_offset: usize,
    pub commit_message: String,
    pub commit_date: String,
    pub commit_author: String,
    pub possible_other_commits: Vec<String>,
}

/// Copy the snapshot, pin it to the candidate, build its image and start a
/// container. Shared between replicas and the ad-hoc runner.
pub(crate) async fn launch_commit(
    job: &JobShared,
    index: usize,
) -> Result<RunningContainer, DriverError> {
    let commit = &job.index.get(index).hash;

    let worktree = checkout_worktree(&job.repo_path, commit)
        .await
        .map_err(DriverError::Other)?;
    let dockerfile = job.dockerfile.resolve(worktree.path()).await?;
    let image = image_ref(commit, &dockerfile, &job.ports);
    job.driver.build(worktree.path(), &dockerfile, &image).await?;
    drop(worktree);

    job.driver.run(&image, &job.ports).await
}

/// One independent bisection over the job's commit index.
pub(crate) struct Replica {
    index: usize,
    job: Arc<JobShared>,
    /// Index of the newest commit known (or trusted) to be bad.
    lo: usize,
    /// Index of the oldest commit known (or trusted) to be good.
    hi: usize,
}

impl Replica {
    pub(crate) fn new(job: Arc<JobShared>, index: usize) -> Self {
        let hi = job.index.good();
        Self { index, job, lo: 0, hi }
    }

    /// Drive the bisection to convergence, or until the stop signal fires.
    /// Any container still running when the loop ends is stopped before the
    /// task returns.
    pub(crate) async fn run(
        mut self,
        rs_tx: mpsc::Sender<RunningSystem>,
        oc_tx: mpsc::Sender<OffendingCommit>,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        let mut current: Option<String> = None;
        let result = {
            let bisect = self.bisect(&rs_tx, &oc_tx, &mut current);
            tokio::pin!(bisect);
            tokio::select! {
                result = &mut bisect => result,
                _ = &mut stop_rx => Ok(()),
            }
        };

        if let Some(id) = current.take() {
            if let Err(e) = self.job.driver.stop(&id).await {
                eprintln!("[replica {}] failed to stop container on shutdown: {}", self.index, e);
            }
        }
        result
    }

    async fn bisect(
        &mut self,
        rs_tx: &mpsc::Sender<RunningSystem>,
        oc_tx: &mpsc::Sender<OffendingCommit>,
        current: &mut Option<String>,
    ) -> Result<()> {
        loop {
            // Selecting. The interval may already be (or collapse to) a
            // single candidate, including pathologically at start.
            if self.hi - self.lo == 1 {
                return self.converge(oc_tx).await;
            }
            let mid = self.lo + (self.hi - self.lo) / 2;
            let candidate = self.resolve(mid)?;
            if candidate >= self.hi {
                // Every commit from the midpoint to the good boundary is
                // broken; nothing left to test.
                return self.converge(oc_tx).await;
            }

            // Building / Starting.
            let container = match launch_commit(&self.job, candidate).await {
                Ok(container) => container,
                Err(e) if e.is_commit_specific() => {
                    eprintln!(
                        "[replica {}] commit {} is broken: {}",
                        self.index,
                        self.job.index.get(candidate).hash,
                        e
                    );
                    self.skip_broken(candidate)?;
                    continue;
                }
                Err(e) => return Err(e).context("container engine failure"),
            };
            *current = Some(container.id.clone());

            // Checking.
            if let Err(e) = run_healthchecks(
                self.job.driver.as_ref(),
                &container,
                &self.job.healthchecks,
                self.job.error_exit_code,
            )
            .await
            {
                match &e {
                    HealthcheckError::Failed { .. } => {
                        eprintln!("[replica {}] healthcheck fault: {}", self.index, e);
                    }
                    HealthcheckError::Unhealthy { .. } => {
                        eprintln!(
                            "[replica {}] commit {} never became healthy",
                            self.index,
                            self.job.index.get(candidate).hash
                        );
                    }
                }
                self.teardown(current).await?;
                self.skip_broken(candidate)?;
                continue;
            }

            // Awaiting verdict.
            let (system, verdict_rx) =
                RunningSystem::new(Some(self.index), candidate, container.ports.clone());
            if rs_tx.send(system).await.is_err() {
                // The judge side is gone; the job is shutting down.
                self.teardown(current).await?;
                return Ok(());
            }
            let report = verdict_rx.await;

            // Teardown, then apply the verdict.
            self.teardown(current).await?;
            match report {
                Ok(Report::Verdict(Verdict::Good)) => self.hi = candidate,
                Ok(Report::Verdict(Verdict::Bad)) => self.lo = candidate,
                Ok(Report::Verdict(Verdict::Broken)) => self.skip_broken(candidate)?,
                Ok(Report::Done) | Err(_) => {
                    // Released without a verdict; the same midpoint is
                    // selected again next round.
                    eprintln!(
                        "[replica {}] system released without a verdict, re-testing",
                        self.index
                    );
                }
            }
        }
    }

    /// Resolve a midpoint through the registry, returning the index of its
    /// effective replacement.
    fn resolve(&self, mid: usize) -> Result<usize> {
        let resolved = self.job.registry.resolve(&self.job.index.get(mid).hash);
        self.job
            .index
            .index_of(&resolved)
            .ok_or_else(|| anyhow!("replacement commit {} is not in the commit index", resolved))
    }

    /// Mark `index` broken, replaced by its neighbour towards the good end.
    /// `lo` and `hi` are untouched; the next resolve skips the commit.
    fn skip_broken(&self, index: usize) -> Result<()> {
        let broken = &self.job.index.get(index).hash;
        let replacement = &self.job.index.get(index + 1).hash;
        self.job.registry.mark(broken, replacement)
    }

    async fn converge(&self, oc_tx: &mpsc::Sender<OffendingCommit>) -> Result<()> {
        let meta = self.job.index.get(self.lo);
        let possible_other_commits = (self.lo + 1..self.hi)
            .map(|k| &self.job.index.get(k).hash)
            .filter(|hash| self.job.registry.is_marked(hash.as_str()))
            .cloned()
            .collect();

        let offending = OffendingCommit {
            replica_index: self.index,
            commit: meta.hash.clone(),
            commit_offset: self.lo,
            commit_message: meta.message.clone(),
            commit_date: meta.date.clone(),
            commit_author: meta.author.clone(),
            possible_other_commits,
        };
        eprintln!(
            "[replica {}] converged on {} (offset {})",
            self.index, offending.commit, offending.commit_offset
        );
        let _ = oc_tx.send(offending).await;
        Ok(())
    }

    async fn teardown(&self, current: &mut Option<String>) -> Result<()> {
        if let Some(id) = current.take() {
            self.job
                .driver
                .stop(&id)
                .await
                .context("container engine failure during teardown")?;
        }
        Ok(())
    }
}
