//! Repository snapshot and commit index.
//!
//! The snapshot is a one-time clone into a temporary directory; per-container
//! working trees are copied from it. The commit index is the immutable,
//! first-parent linearisation between the bad and the good commit that every
//! replica bisects over.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, TimeZone};
use git2::{Repository, Sort, build::CheckoutBuilder};
use tempfile::TempDir;

use crate::errors::JobError;

/// Everything a replica needs to know about one commit, captured once at
/// enumeration time so replicas never touch the git library afterwards.
#[derive(Debug, Clone)]
pub struct CommitMeta {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub date: String,
}

/// Ordered candidate commits: index 0 is the bad commit, the last index is
/// the good commit, everything between is a first-parent ancestor of bad,
/// newest first. Offset `k` means "k commits behind bad".
#[derive(Debug)]
pub struct CommitIndex {
    commits: Vec<CommitMeta>,
    by_hash: HashMap<String, usize>,
}

impl CommitIndex {
    fn new(commits: Vec<CommitMeta>) -> Self {
        let by_hash = commits
            .iter()
            .enumerate()
            .map(|(i, c)| (c.hash.clone(), i))
            .collect();
        Self { commits, by_hash }
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn get(&self, index: usize) -> &CommitMeta {
        &self.commits[index]
    }

    pub fn index_of(&self, hash: &str) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    /// Index of the known-good boundary.
    pub fn good(&self) -> usize {
        self.commits.len() - 1
    }
}

/// A cloned copy of the repository under bisection. The directory is removed
/// when the snapshot is dropped, i.e. at job stop.
pub struct RepoSnapshot {
    dir: TempDir,
}

impl RepoSnapshot {
    /// Clone `repository` into a fresh temporary directory.
    pub fn clone_from(repository: &str) -> Result<Self, JobError> {
        let dir = TempDir::with_prefix("culprit-repo-")
            .map_err(|e| JobError::Other(e.into()))?;
        Repository::clone(repository, dir.path()).map_err(|source| JobError::CloneFailed {
            repository: repository.to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Enumerate the candidate commits: first-parent ancestors of `bad`,
    /// stopping at (and excluding) ancestors of `good`, newest first, with
    /// `good` itself appended as the final entry.
    pub fn enumerate(&self, good: &str, bad: &str) -> Result<CommitIndex, JobError> {
        let enumerate = || -> Result<Vec<CommitMeta>, git2::Error> {
            let repo = Repository::open(self.dir.path())?;
            let bad_commit = repo.revparse_single(bad)?.peel_to_commit()?;
            let good_commit = repo.revparse_single(good)?.peel_to_commit()?;

            let mut walk = repo.revwalk()?;
            walk.set_sorting(Sort::TOPOLOGICAL)?;
            walk.simplify_first_parent()?;
            walk.push(bad_commit.id())?;
            walk.hide(good_commit.id())?;

            let mut commits = Vec::new();
            for oid in walk {
                let commit = repo.find_commit(oid?)?;
                commits.push(meta(&commit));
            }
            if !commits.is_empty() {
                commits.push(meta(&good_commit));
            }
            Ok(commits)
        };

        let commits = enumerate().map_err(|source| JobError::EnumerateFailed {
            good: good.to_string(),
            bad: bad.to_string(),
            source,
        })?;

        if commits.len() < 2 {
            return Err(JobError::NoCommits {
                good: good.to_string(),
                bad: bad.to_string(),
            });
        }
        Ok(CommitIndex::new(commits))
    }
}

fn meta(commit: &git2::Commit<'_>) -> CommitMeta {
    let author = commit.author();
    let author_str = match author.email() {
        Some(email) => format!("{} <{}>", author.name().unwrap_or(""), email),
        None => author.name().unwrap_or("").to_string(),
    };

    let time = commit.time();
    let date = FixedOffset::east_opt(time.offset_minutes() * 60)
        .and_then(|offset| offset.timestamp_opt(time.seconds(), 0).single())
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();

    CommitMeta {
        hash: commit.id().to_string(),
        message: commit.message().unwrap_or("").trim_end().to_string(),
        author: author_str,
        date,
    }
}

/// Copy the snapshot into a fresh working tree and pin it to `commit`.
/// Copy-on-write (`--reflink=auto`) when the filesystem supports it, plain
/// copy otherwise.
pub async fn checkout_worktree(snapshot: &Path, commit: &str) -> anyhow::Result<TempDir> {
    use anyhow::Context;

    let dir = TempDir::with_prefix("culprit-worktree-").context("Failed to create working tree")?;

    let reflink = tokio::process::Command::new("cp")
        .arg("-a")
        .arg("--reflink=auto")
        .arg(format!("{}/.", snapshot.display()))
        .arg(dir.path())
        .status()
        .await
        .context("Failed to run cp")?;
    if !reflink.success() {
        let plain = tokio::process::Command::new("cp")
            .arg("-a")
            .arg(format!("{}/.", snapshot.display()))
            .arg(dir.path())
            .status()
            .await
            .context("Failed to run cp")?;
        if !plain.success() {
            anyhow::bail!("Failed to copy working tree from {}", snapshot.display());
        }
    }

    let repo = Repository::open(dir.path()).context("Failed to open working tree copy")?;
    let object = repo
        .revparse_single(commit)
        .with_context(|| format!("Commit {} not found in working tree", commit))?;
    repo.checkout_tree(&object, Some(CheckoutBuilder::new().force()))
        .with_context(|| format!("Failed to check out {}", commit))?;
    repo.set_head_detached(object.id())
        .with_context(|| format!("Failed to detach HEAD at {}", commit))?;

    Ok(dir)
}
