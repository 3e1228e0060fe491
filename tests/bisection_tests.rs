//! End-to-end bisection scenarios against a scripted container driver.
//!
//! Each test builds a small local git repository, runs a real job over it and
//! plays judge on the returned channels. The driver never touches a container
//! engine: builds, starts and script healthchecks are scripted per commit, so
//! the full replica state machine runs in-process.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use git2::{Repository, Signature};
use tempfile::TempDir;
use tokio::sync::mpsc;

use culprit::config::JobConfig;
use culprit::docker::{ContainerDriver, RunningContainer};
use culprit::errors::{DriverError, JobError};
use culprit::job::{Job, OffendingCommit, RunningSystem};

// ── Fixtures ─────────────────────────────────────────────────────────

/// A linear repository with `count` commits. Returns the directory and the
/// commit hashes oldest first, so `hashes[count - 1 - offset]` is the commit
/// at `offset` behind the bad (newest) commit.
fn fixture_repo(count: usize) -> (TempDir, Vec<String>) {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    let sig = Signature::now("fixture", "fixture@example.com").unwrap();

    let mut hashes = Vec::new();
    let mut parent: Option<git2::Oid> = None;
    for i in 0..count {
        std::fs::write(dir.path().join("counter.txt"), format!("{}", i)).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let parents: Vec<git2::Commit> = parent
            .map(|id| vec![repo.find_commit(id).unwrap()])
            .unwrap_or_default();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, &format!("commit {}", i), &tree, &parent_refs)
            .unwrap();
        hashes.push(oid.to_string());
        parent = Some(oid);
    }
    (dir, hashes)
}

/// Hash of the commit at `offset` behind the bad end.
fn hash_at(hashes: &[String], offset: usize) -> &str {
    &hashes[hashes.len() - 1 - offset]
}

// ── Scripted driver ──────────────────────────────────────────────────

#[derive(Default)]
struct DriverLog {
    /// container id → commit hash
    containers: HashMap<String, String>,
    started: Vec<String>,
    stopped: HashSet<String>,
    next_port: u16,
}

/// A container driver whose failures are scripted per commit hash.
#[derive(Default)]
struct ScriptedDriver {
    broken_builds: HashSet<String>,
    broken_starts: HashSet<String>,
    broken_healthchecks: HashSet<String>,
    log: Mutex<DriverLog>,
}

impl ScriptedDriver {
    fn new() -> Self {
        Self {
            log: Mutex::new(DriverLog { next_port: 40000, ..Default::default() }),
            ..Default::default()
        }
    }

    fn commit_of(image_ref: &str) -> String {
        image_ref
            .strip_prefix("culprit-")
            .and_then(|rest| rest.split(':').next())
            .expect("image ref has the culprit-<commit>:<tag> shape")
            .to_string()
    }

    fn all_containers_stopped(&self) -> bool {
        let log = self.log.lock().unwrap();
        log.started.iter().all(|id| log.stopped.contains(id))
    }
}

#[async_trait]
impl ContainerDriver for ScriptedDriver {
    async fn build(
        &self,
        workdir: &Path,
        _dockerfile: &str,
        image_ref: &str,
    ) -> Result<String, DriverError> {
        // The working tree really is pinned to the commit being built.
        assert!(workdir.join("counter.txt").exists());
        if self.broken_builds.contains(&Self::commit_of(image_ref)) {
            return Err(DriverError::BuildFailed("scripted build failure".into()));
        }
        Ok(image_ref.to_string())
    }

    async fn run(&self, image: &str, ports: &[u16]) -> Result<RunningContainer, DriverError> {
        let commit = Self::commit_of(image);
        if self.broken_starts.contains(&commit) {
            return Err(DriverError::StartFailed("scripted start failure".into()));
        }

        let mut log = self.log.lock().unwrap();
        let id = format!("ctr-{}", log.started.len());
        let mut port_map = HashMap::new();
        for port in ports {
            log.next_port += 1;
            port_map.insert(*port, log.next_port);
        }
        log.containers.insert(id.clone(), commit);
        log.started.push(id.clone());
        Ok(RunningContainer { id, ports: port_map })
    }

    async fn stop(&self, container_id: &str) -> Result<(), DriverError> {
        self.log.lock().unwrap().stopped.insert(container_id.to_string());
        Ok(())
    }

    async fn exec(&self, container_id: &str, _script: &str) -> Result<i64, DriverError> {
        let commit = self.log.lock().unwrap().containers[container_id].clone();
        if self.broken_healthchecks.contains(&commit) {
            Ok(1)
        } else {
            Ok(0)
        }
    }
}

// ── Job + judge plumbing ─────────────────────────────────────────────

fn make_job(
    repo: &Path,
    good: &str,
    bad: &str,
    replicas: usize,
    driver: Arc<ScriptedDriver>,
    backup: &Path,
) -> Job {
    let yaml = format!(
        r#"
repository: {}
goodCommit: {}
badCommit: {}
port: 3333
healthcheck:
  - port: 3333
    checkType: Script
    data: "true"
    config:
      retries: 2
      backoff: 1
      maxBackoff: 2
dockerfile: "FROM alpine"
"#,
        repo.display(),
        good,
        bad
    );
    let config = JobConfig::from_reader(yaml.as_bytes()).unwrap();
    let mut job = Job::from_config(config).unwrap().with_driver(driver);
    job.replicas_count = replicas;
    job.replacements_backup = backup.to_path_buf();
    job
}

/// Play judge until `expected` offending commits arrived: a system is bad iff
/// its offset is at or below the offender's offset for its replica.
async fn judge(
    rs_rx: &mut mpsc::Receiver<RunningSystem>,
    oc_rx: &mut mpsc::Receiver<OffendingCommit>,
    offender_offsets: &[usize],
    expected: usize,
) -> Vec<OffendingCommit> {
    let mut converged = Vec::new();
    while converged.len() < expected {
        tokio::select! {
            Some(system) = rs_rx.recv() => {
                let replica = system.replica_index.expect("bisection systems carry a replica index");
                if system.commit_offset <= offender_offsets[replica] {
                    system.is_bad();
                } else {
                    system.is_good();
                }
            }
            Some(commit) = oc_rx.recv() => converged.push(commit),
            else => panic!("channels closed before every replica converged"),
        }
    }
    converged
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn single_bisection_converges_on_the_offender() {
    let (repo, hashes) = fixture_repo(11);
    let driver = Arc::new(ScriptedDriver::new());
    let backup = TempDir::new().unwrap();

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 10),
        hash_at(&hashes, 0),
        1,
        driver.clone(),
        &backup.path().join("replacements.log"),
    );
    let (mut rs_rx, mut oc_rx) = job.run().await.unwrap();

    let converged = judge(&mut rs_rx, &mut oc_rx, &[4], 1).await;
    assert_eq!(converged.len(), 1);
    let offending = &converged[0];
    assert_eq!(offending.replica_index, 0);
    assert_eq!(offending.commit, hash_at(&hashes, 4));
    assert_eq!(offending.commit_offset, 4);
    assert_eq!(offending.commit_message, "commit 6");
    assert!(offending.commit_author.contains("fixture@example.com"));
    assert!(offending.possible_other_commits.is_empty());

    job.stop().await.unwrap();
    assert!(driver.all_containers_stopped());
}

#[tokio::test]
async fn no_commit_is_tested_twice_by_a_replica() {
    let (repo, hashes) = fixture_repo(11);
    let driver = Arc::new(ScriptedDriver::new());
    let backup = TempDir::new().unwrap();

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 10),
        hash_at(&hashes, 0),
        1,
        driver,
        &backup.path().join("replacements.log"),
    );
    let (mut rs_rx, mut oc_rx) = job.run().await.unwrap();

    let mut seen = Vec::new();
    loop {
        tokio::select! {
            Some(system) = rs_rx.recv() => {
                seen.push(system.commit_offset);
                if system.commit_offset <= 7 { system.is_bad() } else { system.is_good() }
            }
            Some(_) = oc_rx.recv() => break,
            else => panic!("channels closed early"),
        }
    }
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "tested offsets {:?} contain a repeat", seen);

    job.stop().await.unwrap();
}

#[tokio::test]
async fn three_concurrent_bisections_find_distinct_offenders() {
    let (repo, hashes) = fixture_repo(11);
    let driver = Arc::new(ScriptedDriver::new());
    let backup = TempDir::new().unwrap();

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 10),
        hash_at(&hashes, 0),
        3,
        driver.clone(),
        &backup.path().join("replacements.log"),
    );
    let (mut rs_rx, mut oc_rx) = job.run().await.unwrap();

    let offenders = [2usize, 5, 8];
    let mut converged = judge(&mut rs_rx, &mut oc_rx, &offenders, 3).await;
    converged.sort_by_key(|oc| oc.replica_index);

    for (replica, offending) in converged.iter().enumerate() {
        assert_eq!(offending.replica_index, replica);
        assert_eq!(offending.commit, hash_at(&hashes, offenders[replica]));
        assert_eq!(offending.commit_offset, offenders[replica]);
        assert!(offending.possible_other_commits.is_empty());
    }

    job.stop().await.unwrap();
    assert!(driver.all_containers_stopped());
}

#[tokio::test]
async fn broken_build_is_skipped_and_backed_up() {
    let (repo, hashes) = fixture_repo(11);
    let mut driver = ScriptedDriver::new();
    driver.broken_builds.insert(hash_at(&hashes, 5).to_string());
    let driver = Arc::new(driver);
    let backup = TempDir::new().unwrap();
    let backup_path = backup.path().join("replacements.log");

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 10),
        hash_at(&hashes, 0),
        1,
        driver.clone(),
        &backup_path,
    );
    let (mut rs_rx, mut oc_rx) = job.run().await.unwrap();

    let converged = judge(&mut rs_rx, &mut oc_rx, &[4], 1).await;
    let offending = &converged[0];

    // The bisection completed as if offset 5 never existed, but records it
    // as a commit it could not rule out.
    assert_eq!(offending.commit, hash_at(&hashes, 4));
    assert_eq!(
        offending.possible_other_commits,
        vec![hash_at(&hashes, 5).to_string()]
    );

    let contents = std::fs::read_to_string(&backup_path).unwrap();
    assert_eq!(
        contents,
        format!("{}:{},", hash_at(&hashes, 5), hash_at(&hashes, 6))
    );

    job.stop().await.unwrap();
    assert!(driver.all_containers_stopped());
}

#[tokio::test]
async fn cascading_brokens_compress_and_report_possible_others() {
    let (repo, hashes) = fixture_repo(11);
    let mut driver = ScriptedDriver::new();
    driver.broken_builds.insert(hash_at(&hashes, 4).to_string());
    driver.broken_builds.insert(hash_at(&hashes, 5).to_string());
    let driver = Arc::new(driver);
    let backup = TempDir::new().unwrap();
    let backup_path = backup.path().join("replacements.log");

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 10),
        hash_at(&hashes, 0),
        1,
        driver.clone(),
        &backup_path,
    );
    let (mut rs_rx, mut oc_rx) = job.run().await.unwrap();

    // Offender at offset 3: the first midpoint (5) is broken and resolves to
    // 6 (good), then 3 tests bad, then midpoint 4 is broken and resolves all
    // the way to the good boundary.
    let converged = judge(&mut rs_rx, &mut oc_rx, &[3], 1).await;
    let offending = &converged[0];

    assert_eq!(offending.commit, hash_at(&hashes, 3));
    assert_eq!(
        offending.possible_other_commits,
        vec![hash_at(&hashes, 4).to_string(), hash_at(&hashes, 5).to_string()]
    );

    // Marking 4 → 5 compresses through the existing 5 → 6 chain.
    let contents = std::fs::read_to_string(&backup_path).unwrap();
    assert_eq!(
        contents,
        format!(
            "{}:{},{}:{},",
            hash_at(&hashes, 5),
            hash_at(&hashes, 6),
            hash_at(&hashes, 4),
            hash_at(&hashes, 6)
        )
    );

    job.stop().await.unwrap();
}

#[tokio::test]
async fn broken_start_is_treated_like_a_broken_build() {
    let (repo, hashes) = fixture_repo(11);
    let mut driver = ScriptedDriver::new();
    driver.broken_starts.insert(hash_at(&hashes, 5).to_string());
    let driver = Arc::new(driver);
    let backup = TempDir::new().unwrap();
    let backup_path = backup.path().join("replacements.log");

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 10),
        hash_at(&hashes, 0),
        1,
        driver.clone(),
        &backup_path,
    );
    let (mut rs_rx, mut oc_rx) = job.run().await.unwrap();

    let converged = judge(&mut rs_rx, &mut oc_rx, &[4], 1).await;
    assert_eq!(converged[0].commit, hash_at(&hashes, 4));

    let contents = std::fs::read_to_string(&backup_path).unwrap();
    assert_eq!(
        contents,
        format!("{}:{},", hash_at(&hashes, 5), hash_at(&hashes, 6))
    );

    job.stop().await.unwrap();
}

#[tokio::test]
async fn failing_healthcheck_is_treated_like_a_broken_build() {
    let (repo, hashes) = fixture_repo(11);
    let mut driver = ScriptedDriver::new();
    driver
        .broken_healthchecks
        .insert(hash_at(&hashes, 5).to_string());
    let driver = Arc::new(driver);
    let backup = TempDir::new().unwrap();
    let backup_path = backup.path().join("replacements.log");

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 10),
        hash_at(&hashes, 0),
        1,
        driver.clone(),
        &backup_path,
    );
    let (mut rs_rx, mut oc_rx) = job.run().await.unwrap();

    let converged = judge(&mut rs_rx, &mut oc_rx, &[4], 1).await;
    assert_eq!(converged[0].commit, hash_at(&hashes, 4));
    assert_eq!(
        converged[0].possible_other_commits,
        vec![hash_at(&hashes, 5).to_string()]
    );

    let contents = std::fs::read_to_string(&backup_path).unwrap();
    assert_eq!(
        contents,
        format!("{}:{},", hash_at(&hashes, 5), hash_at(&hashes, 6))
    );

    job.stop().await.unwrap();
    assert!(driver.all_containers_stopped());
}

#[tokio::test]
async fn external_broken_verdict_skips_the_commit() {
    let (repo, hashes) = fixture_repo(11);
    let driver = Arc::new(ScriptedDriver::new());
    let backup = TempDir::new().unwrap();
    let backup_path = backup.path().join("replacements.log");

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 10),
        hash_at(&hashes, 0),
        1,
        driver.clone(),
        &backup_path,
    );
    let (mut rs_rx, mut oc_rx) = job.run().await.unwrap();

    // The judge reports offset 5 broken; otherwise the offender sits at 4.
    let mut converged = Vec::new();
    while converged.is_empty() {
        tokio::select! {
            Some(system) = rs_rx.recv() => {
                if system.commit_offset == 5 {
                    system.is_broken();
                } else if system.commit_offset <= 4 {
                    system.is_bad();
                } else {
                    system.is_good();
                }
            }
            Some(commit) = oc_rx.recv() => converged.push(commit),
            else => panic!("channels closed early"),
        }
    }

    assert_eq!(converged[0].commit, hash_at(&hashes, 4));
    assert_eq!(
        converged[0].possible_other_commits,
        vec![hash_at(&hashes, 5).to_string()]
    );
    let contents = std::fs::read_to_string(&backup_path).unwrap();
    assert_eq!(
        contents,
        format!("{}:{},", hash_at(&hashes, 5), hash_at(&hashes, 6))
    );

    job.stop().await.unwrap();
}

#[tokio::test]
async fn adjacent_good_and_bad_converge_without_tests() {
    let (repo, hashes) = fixture_repo(2);
    let driver = Arc::new(ScriptedDriver::new());
    let backup = TempDir::new().unwrap();

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 1),
        hash_at(&hashes, 0),
        1,
        driver.clone(),
        &backup.path().join("replacements.log"),
    );
    let (_rs_rx, mut oc_rx) = job.run().await.unwrap();

    let offending = oc_rx.recv().await.expect("replica converges immediately");
    assert_eq!(offending.commit, hash_at(&hashes, 0));
    assert_eq!(offending.commit_offset, 0);
    assert!(offending.possible_other_commits.is_empty());
    assert!(driver.log.lock().unwrap().started.is_empty());

    job.stop().await.unwrap();
}

#[tokio::test]
async fn adhoc_run_validates_lifecycle_and_offsets() {
    let (repo, hashes) = fixture_repo(11);
    let driver = Arc::new(ScriptedDriver::new());
    let backup = TempDir::new().unwrap();

    let mut job = make_job(
        repo.path(),
        hash_at(&hashes, 10),
        hash_at(&hashes, 0),
        0,
        driver.clone(),
        &backup.path().join("replacements.log"),
    );

    // Before run: no commit index yet.
    let err = job.run_commit_by_offset(1).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<JobError>(), Some(JobError::NotInitialized)));

    let (_rs_rx, _oc_rx) = job.run().await.unwrap();

    // Out of range.
    let err = job.run_commit_by_offset(100).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<JobError>(),
        Some(JobError::OffsetOutOfRange { offset: 100, count: 11 })
    ));

    // In range: a usable system, independent of any replica.
    let system = job.run_commit_by_offset(1).await.unwrap();
    assert_eq!(system.replica_index, None);
    assert_eq!(system.commit_offset, 1);
    assert_eq!(system.ports.len(), 1);

    system.done();
    // The watcher task releases the container.
    for _ in 0..50 {
        if driver.all_containers_stopped() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(driver.all_containers_stopped());

    job.stop().await.unwrap();
}
