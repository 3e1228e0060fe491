//! Broken-commit registry, shared by every replica of a job.
//!
//! A commit that cannot be built or healthchecked is mapped to its
//! replacement (the next commit towards the good end). The mapping is
//! serialised behind a mutex and every insertion is appended to a backup
//! file so external tooling can audit which commits were skipped.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Process-wide map of broken commit → replacement commit.
pub struct CommitReplacements {
    inner: Mutex<Inner>,
}

struct Inner {
    map: HashMap<String, String>,
    backup: File,
}

impl CommitReplacements {
    /// Open (or create) the backup file and start with an empty registry.
    /// The file is only ever appended to.
    pub fn open(backup_path: &Path) -> Result<Self> {
        let backup = OpenOptions::new()
            .create(true)
            .append(true)
            .open(backup_path)
            .with_context(|| {
                format!("Failed to open replacements backup at {}", backup_path.display())
            })?;
        Ok(Self {
            inner: Mutex::new(Inner { map: HashMap::new(), backup }),
        })
    }

    /// Record `broken → replacement`. If the replacement is itself marked
    /// broken, the chain is followed to its fixpoint first, so the stored
    /// mapping always points at a commit that was testable at insertion
    /// time. The mapping is appended to the backup file before `mark`
    /// returns.
    pub fn mark(&self, broken: &str, replacement: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("replacements lock poisoned");

        let target = follow(&inner.map, replacement);
        inner.map.insert(broken.to_string(), target.clone());

        write!(inner.backup, "{}:{},", broken, target)
            .context("Failed to append to replacements backup")?;
        inner
            .backup
            .sync_data()
            .context("Failed to flush replacements backup")?;
        Ok(())
    }

    /// Follow replacements from `commit` until an unmarked commit is reached.
    /// Unmarked commits resolve to themselves.
    pub fn resolve(&self, commit: &str) -> String {
        let inner = self.inner.lock().expect("replacements lock poisoned");
        follow(&inner.map, commit)
    }

    pub fn is_marked(&self, commit: &str) -> bool {
        let inner = self.inner.lock().expect("replacements lock poisoned");
        inner.map.contains_key(commit)
    }
}

/// Chase the replacement chain to its fixpoint. Terminates because every
/// replacement lies strictly nearer the good end than its key.
fn follow(map: &HashMap<String, String>, commit: &str) -> String {
    let mut current = commit;
    while let Some(next) = map.get(current) {
        current = next;
    }
    current.to_string()
}
