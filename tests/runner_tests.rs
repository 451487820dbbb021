
use std::time::Duration;

use sharddist::config::ScanConfig;
use sharddist::jobs::ClaimedJob;
use sharddist::worker::{ScanRunner, ScanStatus};
use test_harness::{descriptor, sh_scan, TestDirs};

fn job(id: &str, input: &std::path::Path) -> ClaimedJob {
    ClaimedJob {
        id: id.to_string(),
        descriptor: descriptor(&input.to_string_lossy(), &["h1"]),
    }
}

fn runner(dirs: &TestDirs, scan: ScanConfig, timeout: Duration) -> ScanRunner {
    ScanRunner::new(scan, dirs.local.path(), timeout)
}

#[tokio::test]
async fn test_scan_writes_shard_to_output() {
    let dirs = TestDirs::new();
    let shard = dirs.shard("a", b"flow records");
    let runner = runner(&dirs, sh_scan("cat > \"$2\""), Duration::from_secs(5));

    let result = runner.run(&job("0000000001", &shard)).await;

    assert_eq!(result.status, ScanStatus::Succeeded);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.bytes_in, 12);
    assert!(!result.output_limited);
    assert_eq!(result.output, runner.local_output("0000000001"));
    assert_eq!(std::fs::read(&result.output).unwrap(), b"flow records");
}

#[tokio::test]
async fn test_scan_receives_flag_output_and_filter() {
    let dirs = TestDirs::new();
    let shard = dirs.shard("a", b"");
    let runner = runner(
        &dirs,
        sh_scan("cat > /dev/null; printf '%s|%s' \"$1\" \"$3\" > \"$2\""),
        Duration::from_secs(5),
    );

    let result = runner.run(&job("0000000002", &shard)).await;

    assert!(result.succeeded());
    assert_eq!(std::fs::read_to_string(&result.output).unwrap(), "-w|any");
}

#[tokio::test]
async fn test_scan_failure_reports_stderr() {
    let dirs = TestDirs::new();
    let shard = dirs.shard("a", b"x");
    let runner = runner(&dirs, sh_scan("echo boom >&2; exit 3"), Duration::from_secs(5));

    let result = runner.run(&job("0000000003", &shard)).await;

    assert_eq!(result.status, ScanStatus::Failed);
    assert_eq!(result.exit_code, Some(3));
    assert!(result.error.unwrap().contains("boom"));
}

#[tokio::test]
async fn test_scan_that_stops_reading_early_still_succeeds() {
    let dirs = TestDirs::new();
    let shard = dirs.shard("big", &vec![b'z'; 1 << 20]);
    let runner = runner(&dirs, sh_scan("head -c 10 > \"$2\""), Duration::from_secs(5));

    let result = runner.run(&job("0000000004", &shard)).await;

    assert_eq!(result.status, ScanStatus::Succeeded);
    assert!(result.output_limited);
    assert_eq!(std::fs::read(&result.output).unwrap(), vec![b'z'; 10]);
}

#[tokio::test]
async fn test_scan_timeout_kills_process() {
    let dirs = TestDirs::new();
    let shard = dirs.shard("a", b"x");
    let runner = runner(&dirs, sh_scan("exec sleep 10"), Duration::from_millis(300));

    let started = std::time::Instant::now();
    let result = runner.run(&job("0000000005", &shard)).await;

    assert_eq!(result.status, ScanStatus::TimedOut);
    assert!(result.error.is_some());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_missing_program_fails() {
    let dirs = TestDirs::new();
    let shard = dirs.shard("a", b"x");
    let scan = ScanConfig {
        program: "/nonexistent/sharddist-scan".into(),
        ..ScanConfig::default()
    };
    let result = runner(&dirs, scan, Duration::from_secs(5))
        .run(&job("0000000006", &shard))
        .await;

    assert_eq!(result.status, ScanStatus::Failed);
    assert!(result.exit_code.is_none());
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_missing_input_fails() {
    let dirs = TestDirs::new();
    let runner = runner(&dirs, sh_scan("cat > \"$2\""), Duration::from_secs(5));

    let result = runner
        .run(&job("0000000007", &dirs.data.path().join("absent")))
        .await;

    assert_eq!(result.status, ScanStatus::Failed);
    assert!(result.error.unwrap().contains("read failed"));
}
