//! Integration tests for streaming completed job outputs into the merge
//! process.


use std::time::Duration;

use sharddist::coord::{Coordination, MemoryTree};
use sharddist::jobs::{ClaimOutcome, ClaimedJob, JobClaimQueue, JobSubmissionQueue, Submission};
use sharddist::manager::{CombineOutcome, ResultCombiner};
use sharddist::storage::SharedStorage;
use test_harness::{
    assert_eventually, descriptor, files_in, open, sh_args, sh_program, test_jobs_config,
    test_paths, TestDirs,
};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

struct Batch {
    tree: MemoryTree,
    dirs: TestDirs,
    storage: SharedStorage,
    queue: JobSubmissionQueue,
    worker: JobClaimQueue,
    stop: CancellationToken,
}

impl Batch {
    async fn new() -> Self {
        let tree = MemoryTree::new();
        let (queue, events) =
            JobSubmissionQueue::new(open(&tree).await, test_paths(), &test_jobs_config(10));
        let stop = CancellationToken::new();
        tokio::spawn(queue.clone().dispatch_watches(events, stop.clone()));
        let worker = JobClaimQueue::new(open(&tree).await, test_paths(), "h1", &test_jobs_config(10));
        let dirs = TestDirs::new();
        let storage = SharedStorage::new(dirs.shared.path());
        Self {
            tree,
            dirs,
            storage,
            queue,
            worker,
            stop,
        }
    }

    async fn submit(&self, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..n {
            match self
                .queue
                .create(&descriptor(&format!("/data/{}", i), &["h1"]))
                .await
                .unwrap()
            {
                Submission::Created(id) => ids.push(id),
                Submission::Canceled => panic!("unexpected cancel"),
            }
        }
        ids
    }

    async fn claim_next(&self) -> ClaimedJob {
        match self.worker.try_take().await.unwrap() {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::NoneEligible => panic!("nothing to claim"),
        }
    }

    /// Claims the next job and finishes it, storing `output` as its blob.
    async fn run_next(&self, output: Option<&[u8]>) -> String {
        let job = self.claim_next().await;
        if let Some(bytes) = output {
            std::fs::write(self.storage.blob_path(&job.id), bytes).unwrap();
        }
        self.worker.finish(&job.id).await.unwrap();
        job.id
    }

    async fn wait_completed(&self, n: usize) {
        let queue = self.queue.clone();
        assert_eventually(
            || {
                let queue = queue.clone();
                async move { queue.completed_count() == n }
            },
            Duration::from_secs(2),
            "completions not observed",
        )
        .await;
    }

    fn combiner(&self) -> ResultCombiner {
        ResultCombiner::new(sh_program(), self.storage.clone(), self.queue.clone())
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[tokio::test]
async fn test_outputs_are_streamed_in_completion_order() {
    let batch = Batch::new().await;
    batch.submit(3).await;
    batch.queue.close();
    batch.run_next(Some(b"first;")).await;
    batch.wait_completed(1).await;
    batch.run_next(None).await;
    batch.wait_completed(2).await;
    batch.run_next(Some(b"third;")).await;
    batch.wait_completed(3).await;

    let (writer, mut reader) = tokio::io::duplex(1 << 16);
    let mut handle = batch
        .combiner()
        .start(&sh_args("cat; printf '[%s]' \"$1\""), "any", writer, tokio::io::sink())
        .unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.outcome, CombineOutcome::Completed);
    assert_eq!(report.streamed, 2);
    assert_eq!(report.missing, 1);
    assert_eq!(report.bytes, 12);
    assert_eq!(report.exit_code, Some(0));

    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "first;third;[any]");
    assert_eq!(files_in(batch.dirs.shared.path()), 0);
}

#[tokio::test]
async fn test_combiner_streams_jobs_finishing_after_start() {
    let batch = Batch::new().await;
    batch.submit(2).await;
    batch.queue.close();

    let (writer, mut reader) = tokio::io::duplex(1 << 16);
    let mut handle = batch
        .combiner()
        .start(&sh_args("exec cat"), "any", writer, tokio::io::sink())
        .unwrap();

    batch.run_next(Some(b"a")).await;
    batch.run_next(Some(b"b")).await;

    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("combiner did not finish")
        .unwrap();
    assert_eq!(report.outcome, CombineOutcome::Completed);
    assert_eq!(report.streamed, 2);

    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    assert_eq!(out.len(), 2);
}

#[tokio::test]
async fn test_early_termination_cancels_and_discards() {
    let batch = Batch::new().await;
    batch.submit(4).await;
    batch.queue.close();
    let big = vec![b'x'; 1 << 20];
    batch.run_next(Some(&big)).await;
    batch.run_next(Some(&big)).await;
    batch.wait_completed(2).await;

    let (writer, mut reader) = tokio::io::duplex(1 << 16);
    let mut handle = batch
        .combiner()
        .start(&sh_args("exec head -c 5"), "any", writer, tokio::io::sink())
        .unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("combiner did not finish")
        .unwrap();

    assert_eq!(report.outcome, CombineOutcome::EarlyTermination);
    assert_eq!(report.streamed, 0);
    assert_eq!(report.discarded, 2);
    assert_eq!(batch.queue.canceled_count(), 2);
    assert!(batch.queue.is_canceled());
    assert_eq!(files_in(batch.dirs.shared.path()), 0);

    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"xxxxx");
    assert_eq!(batch.worker.try_take().await.unwrap(), ClaimOutcome::NoneEligible);
}

#[tokio::test]
async fn test_stop_kills_a_waiting_combiner() {
    let batch = Batch::new().await;
    batch.submit(1).await;
    batch.queue.close();

    let mut handle = batch
        .combiner()
        .start(&sh_args("exec cat"), "any", tokio::io::sink(), tokio::io::sink())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop();

    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("combiner ignored stop")
        .unwrap();
    assert_eq!(report.outcome, CombineOutcome::Stopped);
    assert_eq!(report.exit_code, None);
}

#[tokio::test]
async fn test_early_termination_waits_for_claimed_job_and_drains_it() {
    let batch = Batch::new().await;
    batch.submit(3).await;
    batch.queue.close();
    batch.run_next(Some(&vec![b'x'; 1 << 20])).await;
    // Still running when the merge process gives up
    let running = batch.claim_next().await;
    batch.wait_completed(1).await;

    let mut handle = batch
        .combiner()
        .start(&sh_args("exec head -c 5"), "any", tokio::io::sink(), tokio::io::sink())
        .unwrap();

    let queue = batch.queue.clone();
    assert_eventually(
        || {
            let queue = queue.clone();
            async move { queue.canceled_count() == 1 }
        },
        Duration::from_secs(5),
        "unclaimed job was not canceled",
    )
    .await;
    assert!(batch.queue.is_canceled());
    let observer = open(&batch.tree).await;
    assert!(observer.get_children(&test_paths().new, None).await.unwrap().is_empty());

    // The claimed job finishes normally and its output is discarded
    std::fs::write(batch.storage.blob_path(&running.id), b"late").unwrap();
    batch.worker.finish(&running.id).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("combiner did not drain the running job")
        .unwrap();
    assert_eq!(report.outcome, CombineOutcome::EarlyTermination);
    assert_eq!(report.streamed, 0);
    assert_eq!(report.discarded, 2);
    assert_eq!(batch.queue.completed_count(), 2);
    assert_eq!(batch.queue.active_count(), 0);
    assert_eq!(files_in(batch.dirs.shared.path()), 0);
}

#[tokio::test]
async fn test_discarded_counts_only_removed_blobs() {
    let batch = Batch::new().await;
    batch.submit(3).await;
    batch.queue.close();
    let big = vec![b'x'; 1 << 20];
    batch.run_next(Some(&big)).await;
    batch.run_next(None).await;
    batch.run_next(Some(&big)).await;
    batch.wait_completed(3).await;

    let mut handle = batch
        .combiner()
        .start(&sh_args("exec head -c 5"), "any", tokio::io::sink(), tokio::io::sink())
        .unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("combiner did not finish")
        .unwrap();

    assert_eq!(report.outcome, CombineOutcome::EarlyTermination);
    assert_eq!(report.discarded, 2);
    assert_eq!(files_in(batch.dirs.shared.path()), 0);
}
