//! End-to-end orchestration over the in-memory stack.
//!
//! Each test stands up a full orchestrator (store, filesystem, local
//! cluster, all shards) and drives it the way a client would: create
//! pipelines and jobs, feed commits, then assert on the rows and the
//! output commits that come out the other side.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use uuid::Uuid;

use sluice_core::domain::commit::DEFAULT_BRANCH;
use sluice_core::domain::datum::Datum;
use sluice_core::domain::input::{AtomInput, Input};
use sluice_core::domain::job::{JobInfo, JobState};
use sluice_core::domain::pipeline::{Egress, PipelineState, Transform};
use sluice_core::dto::job::{CreateJobRequest, ListJobQuery, RestartDatumRequest};
use sluice_core::dto::log::GetLogsQuery;
use sluice_core::dto::pipeline::{CreatePipelineRequest, DeletePipelineQuery};

use sluice_orchestrator::cluster::local::{CopyRunner, LocalCluster};
use sluice_orchestrator::cluster::{TransformRunner, job_group, pipeline_group};
use sluice_orchestrator::config::Config;
use sluice_orchestrator::scheduler::Orchestrator;
use sluice_orchestrator::service::log::LogError;
use sluice_orchestrator::service::{job_service, log_service, pipeline_service};
use sluice_orchestrator::store::memory::MemoryBackend;
use sluice_orchestrator::store::{JOBS, PIPELINES, Store};
use sluice_orchestrator::vfs::Vfs;
use sluice_orchestrator::vfs::memory::MemVfs;

const SETTLE: Duration = Duration::from_secs(10);

fn config() -> Config {
    Config {
        shard_count: 4,
        retry_initial: Duration::from_millis(50),
        retry_max: Duration::from_millis(200),
        ..Config::default()
    }
}

fn stack_with_runner(runner: Arc<dyn TransformRunner>) -> (Orchestrator, Arc<MemVfs>) {
    let store = Store::new(Arc::new(MemoryBackend::new()));
    let vfs = Arc::new(MemVfs::new());
    let cluster = Arc::new(LocalCluster::new(vfs.clone(), runner, 1, 16));
    let orch = Orchestrator::new(store, vfs.clone(), cluster, config());
    for shard in 0..orch.config().shard_count {
        orch.add_shard(shard).unwrap();
    }
    (orch, vfs)
}

fn stack() -> (Orchestrator, Arc<MemVfs>) {
    stack_with_runner(Arc::new(CopyRunner))
}

async fn wait_for<T>(what: &str, mut probe: impl AsyncFnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + SETTLE;
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

fn atom_input(repo: &str, glob: &str) -> Input {
    Input::Atom(AtomInput {
        name: String::new(),
        repo: repo.to_string(),
        commit: String::new(),
        glob: glob.to_string(),
        lazy: false,
        from_commit: None,
    })
}

fn pipeline_request(name: &str, input: Input) -> CreatePipelineRequest {
    CreatePipelineRequest {
        name: name.to_string(),
        transform: Transform {
            image: "copy:latest".to_string(),
            cmd: vec!["copy".to_string()],
            env: Default::default(),
        },
        parallelism: None,
        input,
        output_branch: None,
        egress: None,
        scale_down_threshold: None,
        update: false,
    }
}

async fn pipeline_jobs(orch: &Orchestrator, pipeline: &str) -> Vec<JobInfo> {
    job_service::list_job(orch, ListJobQuery {
        pipeline: Some(pipeline.to_string()),
    })
    .await
    .unwrap()
}

/// First job the pipeline schedules, in any state.
async fn wait_for_job(orch: &Orchestrator, pipeline: &str) -> JobInfo {
    wait_for("a job to appear", async || {
        pipeline_jobs(orch, pipeline).await.into_iter().next()
    })
    .await
}

async fn wait_for_job_state(orch: &Orchestrator, id: Uuid, state: JobState) -> JobInfo {
    wait_for("job state change", async || {
        let job = job_service::inspect_job(orch, id, false).await.unwrap();
        (job.state == state).then_some(job)
    })
    .await
}

/// Blocks on the job watch until the row settles, then asserts the
/// terminal state.
async fn settle_job(orch: &Orchestrator, id: Uuid, state: JobState) -> JobInfo {
    let job = timeout(SETTLE, job_service::inspect_job(orch, id, true))
        .await
        .expect("job did not settle")
        .unwrap();
    assert_eq!(job.state, state);
    job
}

#[tokio::test]
async fn test_commit_flows_through_pipeline() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    wait_for("pipeline running", async || {
        let info = pipeline_service::inspect_pipeline(&orch, "edges")
            .await
            .unwrap();
        (info.state == PipelineState::Running).then_some(())
    })
    .await;

    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one"), ("/b.png", b"two")])
        .unwrap();

    let job = wait_for_job(&orch, "edges").await;
    let job = settle_job(&orch, job.id, JobState::Success).await;

    assert_eq!(job.datums_total, 2);
    assert_eq!(job.datums_processed, 2);
    assert!(job.finished_at.is_some());
    assert!(job.stopped);

    // The output commit is the branch head and carries the copied files,
    // with the input snapshot recorded as provenance.
    let head = vfs
        .branch_head("edges", DEFAULT_BRANCH)
        .await
        .unwrap()
        .expect("output head");
    assert_eq!(job.output_commit, Some(head.clone()));
    assert_eq!(vfs.get_file(&head, "/a.png").await.unwrap(), b"one");
    assert_eq!(vfs.get_file(&head, "/b.png").await.unwrap(), b"two");
    let info = vfs.inspect_commit(&head).await.unwrap();
    assert_eq!(info.provenance, job.input.commits());

    let pipeline = pipeline_service::inspect_pipeline(&orch, "edges")
        .await
        .unwrap();
    assert_eq!(pipeline.job_counts.success, 1);
    assert_eq!(pipeline.job_counts.starting, 0);
    assert_eq!(pipeline.job_counts.running, 0);
}

#[tokio::test]
async fn test_new_commits_chain_jobs() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();

    let first = wait_for_job(&orch, "edges").await;
    let first = settle_job(&orch, first.id, JobState::Success).await;

    vfs.commit_files("images", DEFAULT_BRANCH, &[("/b.png", b"two")])
        .unwrap();
    let second = wait_for("a second job", async || {
        pipeline_jobs(&orch, "edges")
            .await
            .into_iter()
            .find(|job| job.id != first.id)
    })
    .await;
    let second = settle_job(&orch, second.id, JobState::Success).await;

    // Jobs of one pipeline form a chain through `parent`.
    assert_eq!(second.parent, Some(first.id));
    // The second snapshot contains both files, so the datum set does too.
    assert_eq!(second.datums_total, 2);

    let head = vfs
        .branch_head("edges", DEFAULT_BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.output_commit, Some(head));

    // Newest first, and no duplicate job for an already-covered snapshot.
    sleep(Duration::from_millis(200)).await;
    let jobs = pipeline_jobs(&orch, "edges").await;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, second.id);
    assert_eq!(jobs[1].id, first.id);
}

struct FailRunner;

#[async_trait]
impl TransformRunner for FailRunner {
    async fn run(
        &self,
        _vfs: &dyn Vfs,
        _transform: &Transform,
        _datum: &Datum,
    ) -> Result<Vec<(String, Vec<u8>)>, String> {
        Err("boom".to_string())
    }
}

#[tokio::test]
async fn test_failed_datum_fails_job() {
    let (orch, vfs) = stack_with_runner(Arc::new(FailRunner));
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();

    let job = wait_for_job(&orch, "edges").await;
    let job = settle_job(&orch, job.id, JobState::Failure).await;
    assert_eq!(job.datums_processed, 0);
    assert!(job.finished_at.is_some());

    // No output commit for a failed job.
    assert!(job.output_commit.is_none());
    assert!(
        vfs.branch_head("edges", DEFAULT_BRANCH)
            .await
            .unwrap()
            .is_none()
    );

    let pipeline = pipeline_service::inspect_pipeline(&orch, "edges")
        .await
        .unwrap();
    assert_eq!(pipeline.job_counts.failure, 1);

    // The worker group outlives the failure, so the attempts stay
    // readable.
    let logs = log_service::get_logs(&orch, GetLogsQuery {
        pipeline: Some("edges".to_string()),
        job: None,
        data_filters: None,
    })
    .await
    .unwrap();
    assert!(logs.iter().any(|line| line.message.contains("datum failed")));
}

struct FlakyRunner {
    calls: AtomicUsize,
}

#[async_trait]
impl TransformRunner for FlakyRunner {
    async fn run(
        &self,
        vfs: &dyn Vfs,
        transform: &Transform,
        datum: &Datum,
    ) -> Result<Vec<(String, Vec<u8>)>, String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err("transient".to_string());
        }
        CopyRunner.run(vfs, transform, datum).await
    }
}

#[tokio::test]
async fn test_flaky_datum_recovers_without_failing_the_job() {
    let runner = Arc::new(FlakyRunner {
        calls: AtomicUsize::new(0),
    });
    let (orch, vfs) = stack_with_runner(runner.clone());
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let job = wait_for_job(&orch, "edges").await;
    let job = settle_job(&orch, job.id, JobState::Success).await;

    // Two transient failures, then the attempt that sticks.
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    assert_eq!(job.datums_processed, 1);
    assert!(job.output_commit.is_some());
}

struct CountingFailRunner {
    calls: AtomicUsize,
}

#[async_trait]
impl TransformRunner for CountingFailRunner {
    async fn run(
        &self,
        _vfs: &dyn Vfs,
        _transform: &Transform,
        _datum: &Datum,
    ) -> Result<Vec<(String, Vec<u8>)>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("broken transform".to_string())
    }
}

#[tokio::test]
async fn test_orphan_job_fails_after_three_attempts_per_datum() {
    let runner = Arc::new(CountingFailRunner {
        calls: AtomicUsize::new(0),
    });
    let (orch, vfs) = stack_with_runner(runner.clone());
    vfs.create_repo("data", Vec::new()).await.unwrap();
    vfs.commit_files("data", DEFAULT_BRANCH, &[("/a.txt", b"payload")])
        .unwrap();

    let job = job_service::create_job(&orch, CreateJobRequest {
        pipeline: None,
        input: atom_input("data", "/*"),
        transform: Some(Transform {
            image: "copy:latest".to_string(),
            cmd: vec!["copy".to_string()],
            env: Default::default(),
        }),
        parallelism: None,
        output_repo: Some("results".to_string()),
        output_branch: None,
        egress: None,
        parent: None,
    })
    .await
    .unwrap();

    let job = settle_job(&orch, job.id, JobState::Failure).await;
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    assert_eq!(job.datums_processed, 0);
    assert!(job.finished_at.is_some());
    assert!(job.output_commit.is_none());

    // The failed orphan's workers stay up so the attempts can be read
    // back through the log API.
    let group = job_group(&orch.config().group_prefix, &job.id);
    assert!(orch.cluster().replicas(&group).await.is_ok());
}

struct StallRunner;

#[async_trait]
impl TransformRunner for StallRunner {
    async fn run(
        &self,
        _vfs: &dyn Vfs,
        _transform: &Transform,
        _datum: &Datum,
    ) -> Result<Vec<(String, Vec<u8>)>, String> {
        sleep(Duration::from_secs(3600)).await;
        Err("timed out".to_string())
    }
}

#[tokio::test]
async fn test_stop_job_mid_flight() {
    let (orch, vfs) = stack_with_runner(Arc::new(StallRunner));
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let job = wait_for_job(&orch, "edges").await;
    wait_for_job_state(&orch, job.id, JobState::Running).await;

    let stopped = job_service::stop_job(&orch, job.id).await.unwrap();
    assert_eq!(stopped.state, JobState::Stopped);
    assert!(stopped.stopped);
    assert!(stopped.finished_at.is_some());
    assert_eq!(stopped.datums_processed, 0);

    let pipeline = pipeline_service::inspect_pipeline(&orch, "edges")
        .await
        .unwrap();
    assert_eq!(pipeline.job_counts.stopped, 1);
    assert_eq!(pipeline.job_counts.running, 0);

    // Terminal states are sticky; a second stop is a no-op.
    let again = job_service::stop_job(&orch, job.id).await.unwrap();
    assert_eq!(again.state, JobState::Stopped);
}

#[tokio::test]
async fn test_stopped_pipeline_schedules_nothing_until_started() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let stopped = pipeline_service::stop_pipeline(&orch, "edges").await.unwrap();
    assert!(stopped.stopped);
    assert_eq!(stopped.state, PipelineState::Stopped);

    // Commits made while stopped go unscheduled.
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(pipeline_jobs(&orch, "edges").await.is_empty());

    // Starting replays the current snapshot and catches up.
    let started = pipeline_service::start_pipeline(&orch, "edges").await.unwrap();
    assert!(!started.stopped);
    let job = wait_for_job(&orch, "edges").await;
    settle_job(&orch, job.id, JobState::Success).await;
}

#[tokio::test]
async fn test_update_pipeline_reprocesses_under_new_version() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    let v1 = pipeline_service::create_pipeline(
        &orch,
        pipeline_request("edges", atom_input("images", "/*")),
    )
    .await
    .unwrap();
    let job1 = wait_for_job(&orch, "edges").await;
    settle_job(&orch, job1.id, JobState::Success).await;
    let old_head = vfs
        .branch_head("edges", DEFAULT_BRANCH)
        .await
        .unwrap()
        .unwrap();

    let mut request = pipeline_request("edges", atom_input("images", "/*"));
    request.transform.image = "copy:next".to_string();
    request.update = true;
    let v2 = pipeline_service::create_pipeline(&orch, request).await.unwrap();

    assert_eq!(v2.id, v1.id);
    assert_eq!(v2.version, 2);
    assert_eq!(v2.created_at, v1.created_at);
    // The tallies start over with the new version.
    assert_eq!(v2.job_counts.success, 0);

    // The old output branch is archived under the old version.
    let archived = vfs
        .branch_head("edges", "master-v1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archived, old_head);

    // The current snapshot is reprocessed by the new code.
    let job2 = wait_for("a version 2 job", async || {
        pipeline_jobs(&orch, "edges")
            .await
            .into_iter()
            .find(|job| job.pipeline.as_ref().is_some_and(|p| p.version == 2))
    })
    .await;
    let job2 = settle_job(&orch, job2.id, JobState::Success).await;
    assert_eq!(job2.transform.image, "copy:next");

    let new_head = vfs
        .branch_head("edges", DEFAULT_BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(new_head, old_head);
    assert_eq!(job2.output_commit, Some(new_head));

    // The old version's worker group is garbage once v2 takes over.
    let prefix = &orch.config().group_prefix;
    let stale = pipeline_group(prefix, "edges", 1);
    wait_for("stale group cleanup", async || {
        orch.cluster().replicas(&stale).await.err()
    })
    .await;

    let pipeline = pipeline_service::inspect_pipeline(&orch, "edges")
        .await
        .unwrap();
    assert_eq!(pipeline.job_counts.success, 1);
}

#[tokio::test]
async fn test_delete_pipeline_keeps_output_and_jobs() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let job = wait_for_job(&orch, "edges").await;
    settle_job(&orch, job.id, JobState::Success).await;

    pipeline_service::delete_pipeline(&orch, "edges", DeletePipelineQuery { delete_jobs: false })
        .await
        .unwrap();

    let err = pipeline_service::inspect_pipeline(&orch, "edges")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        sluice_orchestrator::service::pipeline::PipelineError::NotFound(_)
    ));

    // Job records survive the pipeline by default.
    let kept = job_service::inspect_job(&orch, job.id, false).await.unwrap();
    assert_eq!(kept.state, JobState::Success);

    // Output data outlives the pipeline; the workers do not.
    assert!(
        vfs.branch_head("edges", DEFAULT_BRANCH)
            .await
            .unwrap()
            .is_some()
    );
    let group = pipeline_group(&orch.config().group_prefix, "edges", 1);
    let err = orch.cluster().replicas(&group).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_pipeline_with_jobs_removes_rows() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let job = wait_for_job(&orch, "edges").await;
    settle_job(&orch, job.id, JobState::Success).await;

    pipeline_service::delete_pipeline(&orch, "edges", DeletePipelineQuery { delete_jobs: true })
        .await
        .unwrap();

    assert!(orch.store().list(&JOBS).await.unwrap().is_empty());
    assert!(orch.store().list(&PIPELINES).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_orphan_job_lifecycle() {
    let (orch, vfs) = stack();
    vfs.create_repo("data", Vec::new()).await.unwrap();
    vfs.commit_files("data", DEFAULT_BRANCH, &[("/a.txt", b"payload")])
        .unwrap();

    let job = job_service::create_job(&orch, CreateJobRequest {
        pipeline: None,
        input: atom_input("data", "/*"),
        transform: Some(Transform {
            image: "copy:latest".to_string(),
            cmd: vec!["copy".to_string()],
            env: Default::default(),
        }),
        parallelism: None,
        output_repo: Some("results".to_string()),
        output_branch: None,
        egress: Some(Egress {
            url: "s3://bucket/results".to_string(),
        }),
        parent: None,
    })
    .await
    .unwrap();
    assert!(job.pipeline.is_none());
    // Branch names in the request are pinned to commit IDs up front.
    for atom in job.input.atoms() {
        assert_ne!(atom.commit, DEFAULT_BRANCH);
    }

    let job = settle_job(&orch, job.id, JobState::Success).await;
    let head = vfs
        .branch_head("results", DEFAULT_BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.output_commit, Some(head.clone()));
    assert_eq!(vfs.get_file(&head, "/a.txt").await.unwrap(), b"payload");

    // Egress fires once the output commit exists.
    assert_eq!(
        vfs.egress_pushes(),
        vec![(head, "s3://bucket/results".to_string())]
    );

    // Orphan worker groups are torn down on success.
    let group = job_group(&orch.config().group_prefix, &job.id);
    wait_for("orphan group cleanup", async || {
        orch.cluster().replicas(&group).await.err()
    })
    .await;

    job_service::delete_job(&orch, job.id).await.unwrap();
    let err = job_service::inspect_job(&orch, job.id, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        sluice_orchestrator::service::job::JobError::NotFound(_)
    ));
}

struct GateRunner {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl TransformRunner for GateRunner {
    async fn run(
        &self,
        vfs: &dyn Vfs,
        transform: &Transform,
        datum: &Datum,
    ) -> Result<Vec<(String, Vec<u8>)>, String> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| "gate closed".to_string())?;
        permit.forget();
        CopyRunner.run(vfs, transform, datum).await
    }
}

#[tokio::test]
async fn test_child_job_commits_after_parent() {
    let gate = Arc::new(Semaphore::new(0));
    let (orch, vfs) = stack_with_runner(Arc::new(GateRunner { gate: gate.clone() }));
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let first = wait_for_job(&orch, "edges").await;
    wait_for_job_state(&orch, first.id, JobState::Running).await;

    // A second snapshot while the first job is still in flight.
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/b.png", b"two")])
        .unwrap();
    let second = wait_for("a second job", async || {
        pipeline_jobs(&orch, "edges")
            .await
            .into_iter()
            .find(|job| job.id != first.id)
    })
    .await;
    assert_eq!(second.parent, Some(first.id));

    // The child sits in STARTING until its parent settles.
    sleep(Duration::from_millis(300)).await;
    let held = job_service::inspect_job(&orch, second.id, false)
        .await
        .unwrap();
    assert_eq!(held.state, JobState::Starting);

    gate.add_permits(16);
    settle_job(&orch, first.id, JobState::Success).await;
    let second = settle_job(&orch, second.id, JobState::Success).await;

    let head = vfs
        .branch_head("edges", DEFAULT_BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.output_commit, Some(head));
}

struct StallOnceRunner {
    calls: AtomicUsize,
}

#[async_trait]
impl TransformRunner for StallOnceRunner {
    async fn run(
        &self,
        _vfs: &dyn Vfs,
        _transform: &Transform,
        _datum: &Datum,
    ) -> Result<Vec<(String, Vec<u8>)>, String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            sleep(Duration::from_secs(3600)).await;
            return Err("stalled".to_string());
        }
        Ok(vec![("/out.txt".to_string(), b"done".to_vec())])
    }
}

#[tokio::test]
async fn test_restart_datum_reruns_inflight_work() {
    let runner = Arc::new(StallOnceRunner {
        calls: AtomicUsize::new(0),
    });
    let (orch, vfs) = stack_with_runner(runner.clone());
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let job = wait_for_job(&orch, "edges").await;
    wait_for_job_state(&orch, job.id, JobState::Running).await;

    // Wait until a worker is actually wedged on the datum.
    wait_for("the datum to be picked up", async || {
        (runner.calls.load(Ordering::SeqCst) >= 1).then_some(())
    })
    .await;

    job_service::restart_datum(&orch, job.id, RestartDatumRequest {
        data_filters: Vec::new(),
    })
    .await
    .unwrap();

    // The restart does not count against the retry budget; the rerun
    // completes the job.
    let job = settle_job(&orch, job.id, JobState::Success).await;
    assert_eq!(job.datums_processed, 1);
    assert_eq!(job.restart, 0);

    let head = vfs
        .branch_head("edges", DEFAULT_BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(vfs.get_file(&head, "/out.txt").await.unwrap(), b"done");
}

#[tokio::test]
async fn test_restart_datum_requires_running_job() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let job = wait_for_job(&orch, "edges").await;
    settle_job(&orch, job.id, JobState::Success).await;

    let err = job_service::restart_datum(&orch, job.id, RestartDatumRequest {
        data_filters: Vec::new(),
    })
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        sluice_orchestrator::service::job::JobError::NotRunning(_)
    ));
}

#[tokio::test]
async fn test_conflicting_writes_fail_the_job() {
    let (orch, vfs) = stack();
    vfs.create_repo("left", Vec::new()).await.unwrap();
    vfs.create_repo("right", Vec::new()).await.unwrap();
    vfs.commit_files("left", DEFAULT_BRANCH, &[("/same.txt", b"from left")])
        .unwrap();
    vfs.commit_files("right", DEFAULT_BRANCH, &[("/same.txt", b"from right")])
        .unwrap();

    // One datum carrying both files; the copy lands them on the same
    // output path with different bytes.
    let input = Input::Cross(vec![
        atom_input("left", "/*"),
        atom_input("right", "/*"),
    ]);
    pipeline_service::create_pipeline(&orch, pipeline_request("merged", input))
        .await
        .unwrap();

    let job = wait_for_job(&orch, "merged").await;
    let job = settle_job(&orch, job.id, JobState::Failure).await;
    assert!(job.output_commit.is_none());
    assert!(
        vfs.branch_head("merged", DEFAULT_BRANCH)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_committed_output_survives_a_controller_restart() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let job = wait_for_job(&orch, "edges").await;
    let job = settle_job(&orch, job.id, JobState::Success).await;
    let head = vfs
        .branch_head("edges", DEFAULT_BRANCH)
        .await
        .unwrap()
        .unwrap();

    // Rewind the row as if the process died between committing the
    // output and recording SUCCESS.
    let key = job.id.to_string();
    orch.store()
        .in_txn(async |txn| {
            let mut job: JobInfo = txn.get(&JOBS, &key).await?.unwrap();
            job.state = JobState::Starting;
            job.stopped = false;
            job.finished_at = None;
            job.output_commit = None;
            txn.put(&JOBS, &key, &job)?;

            let mut pipeline = txn.get(&PIPELINES, "edges").await?.unwrap();
            pipeline.job_counts.decrement(JobState::Success);
            pipeline.job_counts.increment(JobState::Starting);
            txn.put(&PIPELINES, "edges", &pipeline)?;
            Ok(())
        })
        .await
        .unwrap();

    // The revived controller finds the committed output by provenance
    // and records it instead of reprocessing.
    let job = settle_job(&orch, job.id, JobState::Success).await;
    assert_eq!(job.output_commit, Some(head.clone()));
    let unchanged = vfs
        .branch_head("edges", DEFAULT_BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged, head);
}

#[tokio::test]
async fn test_idle_pipeline_scales_to_zero_and_back() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    let mut request = pipeline_request("edges", atom_input("images", "/*"));
    request.scale_down_threshold = Some(1);
    pipeline_service::create_pipeline(&orch, request).await.unwrap();

    let job = wait_for_job(&orch, "edges").await;
    settle_job(&orch, job.id, JobState::Success).await;

    let group = pipeline_group(&orch.config().group_prefix, "edges", 1);
    wait_for("scale down to zero", async || {
        (orch.cluster().replicas(&group).await.unwrap() == 0).then_some(())
    })
    .await;

    // New work brings the workers back.
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/b.png", b"two")])
        .unwrap();
    let second = wait_for("a second job", async || {
        pipeline_jobs(&orch, "edges")
            .await
            .into_iter()
            .find(|j| j.id != job.id)
    })
    .await;
    settle_job(&orch, second.id, JobState::Success).await;
    assert!(orch.cluster().replicas(&group).await.unwrap() > 0);
}

#[tokio::test]
async fn test_new_work_cancels_a_pending_scale_down() {
    let gate = Arc::new(Semaphore::new(1));
    let (orch, vfs) = stack_with_runner(Arc::new(GateRunner { gate: gate.clone() }));
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();

    let mut request = pipeline_request("edges", atom_input("images", "/*"));
    request.scale_down_threshold = Some(4);
    pipeline_service::create_pipeline(&orch, request).await.unwrap();

    // The single permit lets the first job through; the idle timer arms
    // on its completion.
    let first = wait_for_job(&orch, "edges").await;
    settle_job(&orch, first.id, JobState::Success).await;
    let idle_at = Instant::now();

    vfs.commit_files("images", DEFAULT_BRANCH, &[("/b.png", b"two")])
        .unwrap();
    let second = wait_for("a second job", async || {
        pipeline_jobs(&orch, "edges")
            .await
            .into_iter()
            .find(|job| job.id != first.id)
    })
    .await;
    wait_for_job_state(&orch, second.id, JobState::Running).await;

    // Hold the second job in flight for a while, then let it finish well
    // before the first timer's deadline.
    sleep(Duration::from_secs(2)).await;
    gate.add_permits(2);
    settle_job(&orch, second.id, JobState::Success).await;

    // Past the deadline the first completion armed: the second job must
    // have replaced that timer, not raced it.
    sleep_until(idle_at + Duration::from_secs(5)).await;
    let group = pipeline_group(&orch.config().group_prefix, "edges", 1);
    assert!(orch.cluster().replicas(&group).await.unwrap() > 0);

    // The timer armed by the second completion still does its job.
    wait_for("scale down to zero", async || {
        (orch.cluster().replicas(&group).await.unwrap() == 0).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_get_logs_filters_and_validates() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one"), ("/b.png", b"two")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let job = wait_for_job(&orch, "edges").await;
    settle_job(&orch, job.id, JobState::Success).await;

    let all = log_service::get_logs(&orch, GetLogsQuery {
        pipeline: Some("edges".to_string()),
        job: None,
        data_filters: None,
    })
    .await
    .unwrap();
    assert!(!all.is_empty());
    assert!(all.iter().all(|m| m.pipeline_name.as_deref() == Some("edges")));

    let narrowed = log_service::get_logs(&orch, GetLogsQuery {
        pipeline: Some("edges".to_string()),
        job: None,
        data_filters: Some("/a.png".to_string()),
    })
    .await
    .unwrap();
    assert!(!narrowed.is_empty());
    assert!(narrowed.len() < all.len());
    assert!(
        narrowed
            .iter()
            .all(|m| m.data.contains(&"/a.png".to_string()))
    );

    let by_job = log_service::get_logs(&orch, GetLogsQuery {
        pipeline: None,
        job: Some(job.id),
        data_filters: None,
    })
    .await
    .unwrap();
    assert_eq!(by_job.len(), all.len());
    assert!(by_job.iter().all(|m| m.job_id == Some(job.id)));

    // Exactly one selector.
    let err = log_service::get_logs(&orch, GetLogsQuery::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LogError::ValidationError(_)));
    let err = log_service::get_logs(&orch, GetLogsQuery {
        pipeline: Some("edges".to_string()),
        job: Some(job.id),
        data_filters: None,
    })
    .await
    .unwrap_err();
    assert!(matches!(err, LogError::ValidationError(_)));

    let err = log_service::get_logs(&orch, GetLogsQuery {
        job: Some(Uuid::new_v4()),
        ..Default::default()
    })
    .await
    .unwrap_err();
    assert!(matches!(err, LogError::JobNotFound(_)));
}

#[tokio::test]
async fn test_delete_all_resets_everything() {
    let (orch, vfs) = stack();
    vfs.create_repo("images", Vec::new()).await.unwrap();
    vfs.create_repo("data", Vec::new()).await.unwrap();
    vfs.commit_files("images", DEFAULT_BRANCH, &[("/a.png", b"one")])
        .unwrap();
    vfs.commit_files("data", DEFAULT_BRANCH, &[("/a.txt", b"x")])
        .unwrap();

    pipeline_service::create_pipeline(&orch, pipeline_request("edges", atom_input("images", "/*")))
        .await
        .unwrap();
    let orphan = job_service::create_job(&orch, CreateJobRequest {
        pipeline: None,
        input: atom_input("data", "/*"),
        transform: Some(Transform {
            image: "copy:latest".to_string(),
            cmd: vec!["copy".to_string()],
            env: Default::default(),
        }),
        parallelism: None,
        output_repo: Some("results".to_string()),
        output_branch: None,
        egress: None,
        parent: None,
    })
    .await
    .unwrap();
    let job = wait_for_job(&orch, "edges").await;
    settle_job(&orch, job.id, JobState::Success).await;
    settle_job(&orch, orphan.id, JobState::Success).await;

    pipeline_service::delete_all(&orch).await.unwrap();

    assert!(orch.store().list(&PIPELINES).await.unwrap().is_empty());
    assert!(orch.store().list(&JOBS).await.unwrap().is_empty());
}
