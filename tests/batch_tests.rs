//! End-to-end batches: a manager and workers sharing one in-memory tree.


use std::sync::Arc;
use std::time::Duration;

use sharddist::coord::{MemoryConnector, MemoryTree};
use sharddist::jobs::{ClaimOutcome, JobClaimQueue};
use sharddist::manager::{BatchMode, BatchRequest, CombineOutcome, Manager, ShardSpec};
use sharddist::worker::Worker;
use test_harness::{files_in, open, sh_args, sh_scan, test_jobs_config, test_paths, TestDirs};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn spawn_worker(
    tree: &MemoryTree,
    dirs: &TestDirs,
    host: &str,
    shutdown: &CancellationToken,
) -> (Arc<Worker>, JoinHandle<()>) {
    let config = dirs.worker_config(host, sh_scan("cat > \"$2\""), test_jobs_config(10));
    let worker = Arc::new(Worker::new(config, Arc::new(MemoryConnector::new(tree.clone()))));
    let running = worker.clone();
    let shutdown = shutdown.clone();
    let handle = tokio::spawn(async move {
        running.run(shutdown).await.unwrap();
    });
    (worker, handle)
}

fn shard(path: &std::path::Path, hosts: &[&str]) -> ShardSpec {
    ShardSpec {
        path: path.to_string_lossy().into_owned(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_shards_two_workers() {
    let tree = MemoryTree::new();
    let dirs = TestDirs::new();
    let shutdown = CancellationToken::new();
    let (w1, h1) = spawn_worker(&tree, &dirs, "h1", &shutdown);
    let (w2, h2) = spawn_worker(&tree, &dirs, "h2", &shutdown);

    let request = BatchRequest {
        args: sh_args("exec cat"),
        filter: "any".to_string(),
        shards: vec![
            shard(&dirs.shard("a", b"a;"), &["h1"]),
            shard(&dirs.shard("b", b"b;"), &["h2"]),
            shard(&dirs.shard("c", b"c;"), &["h1", "h2"]),
        ],
        no_files: false,
    };
    let manager = Manager::new(
        dirs.manager_config(test_jobs_config(2)),
        Arc::new(MemoryConnector::new(tree.clone())),
    );

    let (writer, mut reader) = tokio::io::duplex(1 << 16);
    let report = manager
        .run(request, writer, tokio::io::sink(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.mode, BatchMode::Distributed);
    assert_eq!(report.submitted, 3);
    assert_eq!(report.completed, 3);
    assert_eq!(report.canceled, 0);
    assert!(!report.timed_out);
    assert!(report.succeeded());
    let combine = report.combine.as_ref().unwrap();
    assert_eq!(combine.outcome, CombineOutcome::Completed);
    assert_eq!(combine.streamed, 3);

    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    let mut parts: Vec<&str> = out.split_terminator(';').collect();
    parts.sort();
    assert_eq!(parts, vec!["a", "b", "c"]);
    assert_eq!(files_in(dirs.shared.path()), 0);

    shutdown.cancel();
    h1.await.unwrap();
    h2.await.unwrap();
    assert_eq!(w1.stats().claimed() + w2.stats().claimed(), 3);
    assert_eq!(w1.stats().failed() + w2.stats().failed(), 0);
    assert!(w1.stats().claimed() >= 1);
    assert!(w2.stats().claimed() >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_scan_still_completes_the_batch() {
    let tree = MemoryTree::new();
    let dirs = TestDirs::new();
    let shutdown = CancellationToken::new();
    let config = dirs.worker_config("h1", sh_scan("exit 1"), test_jobs_config(10));
    let worker = Arc::new(Worker::new(config, Arc::new(MemoryConnector::new(tree.clone()))));
    let running = worker.clone();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { running.run(token).await.unwrap() });

    let request = BatchRequest {
        args: sh_args("exec cat"),
        filter: "any".to_string(),
        shards: vec![
            shard(&dirs.shard("a", b"a"), &["h1"]),
            shard(&dirs.shard("b", b"b"), &["h1"]),
        ],
        no_files: false,
    };
    let manager = Manager::new(
        dirs.manager_config(test_jobs_config(10)),
        Arc::new(MemoryConnector::new(tree.clone())),
    );
    let report = manager
        .run(request, tokio::io::sink(), tokio::io::sink(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.completed, 2);
    let combine = report.combine.unwrap();
    assert_eq!(combine.streamed, 0);
    assert_eq!(combine.missing, 2);

    shutdown.cancel();
    handle.await.unwrap();
    assert_eq!(worker.stats().failed(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_crash_times_out_the_batch() {
    let tree = MemoryTree::new();
    let dirs = TestDirs::new();

    let request = BatchRequest {
        args: sh_args("exec cat"),
        filter: "any".to_string(),
        shards: vec![
            shard(&dirs.shard("a", b"a"), &["h1"]),
            shard(&dirs.shard("b", b"b"), &["h1"]),
        ],
        no_files: false,
    };
    let mut jobs = test_jobs_config(10);
    jobs.job_timeout_secs = 1;
    let manager = Manager::new(
        dirs.manager_config(jobs),
        Arc::new(MemoryConnector::new(tree.clone())),
    );
    let batch = tokio::spawn(async move {
        manager
            .run(request, tokio::io::sink(), tokio::io::sink(), CancellationToken::new())
            .await
    });

    // A worker claims both jobs and dies without finishing them
    let crashing = JobClaimQueue::new(open(&tree).await, test_paths(), "h1", &test_jobs_config(10));
    let mut claimed = 0;
    while claimed < 2 {
        match crashing.try_take().await.unwrap() {
            ClaimOutcome::Claimed(_) => claimed += 1,
            ClaimOutcome::NoneEligible => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    tree.expire_session(crashing.session_id()).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(10), batch)
        .await
        .expect("batch did not time out")
        .unwrap()
        .unwrap();
    assert!(report.timed_out);
    assert!(!report.succeeded());
    assert_eq!(report.submitted, 2);
    assert_eq!(report.completed, 0);
}

#[tokio::test]
async fn test_single_shard_runs_directly() {
    let tree = MemoryTree::new();
    let dirs = TestDirs::new();
    let request = BatchRequest {
        args: sh_args("cat; printf '<%s>' \"$1\""),
        filter: "port 53".to_string(),
        shards: vec![shard(&dirs.shard("only", b"records"), &["h1"])],
        no_files: false,
    };
    let manager = Manager::new(
        dirs.manager_config(test_jobs_config(10)),
        Arc::new(MemoryConnector::new(tree.clone())),
    );

    let (writer, mut reader) = tokio::io::duplex(1 << 16);
    let report = manager
        .run(request, writer, tokio::io::sink(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.mode, BatchMode::Direct);
    assert!(report.succeeded());
    assert_eq!(report.local.as_ref().unwrap().bytes_in, 7);

    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "records<port 53>");
}

#[tokio::test]
async fn test_no_files_runs_passthrough() {
    let tree = MemoryTree::new();
    let dirs = TestDirs::new();
    let request = BatchRequest {
        args: sh_args("echo \"checked $1\""),
        filter: "proto udp".to_string(),
        shards: Vec::new(),
        no_files: true,
    };
    let manager = Manager::new(
        dirs.manager_config(test_jobs_config(10)),
        Arc::new(MemoryConnector::new(tree.clone())),
    );

    let (writer, mut reader) = tokio::io::duplex(1 << 16);
    let report = manager
        .run(request, writer, tokio::io::sink(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.mode, BatchMode::Passthrough);
    assert!(report.succeeded());
    let json = report.to_json().unwrap();
    assert!(json.contains("\"passthrough\""));

    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "checked proto udp\n");
}
