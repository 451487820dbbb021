use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Connection settings for the coordination service.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// gRPC endpoint of the coordination server
    pub endpoint: String,
    /// Root node under which all sharddist state lives
    pub root: String,
    /// Session timeout requested from the server
    pub session_timeout_ms: u64,
    /// Fixed backoff between retries after a connection loss
    pub retry_backoff_ms: u64,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:2281".to_string(),
            root: "/sharddist".to_string(),
            session_timeout_ms: 10_000,
            retry_backoff_ms: 100,
        }
    }
}

impl CoordConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Job queue tuning shared by the manager and the workers.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Name of the jobs node below the coordination root
    pub jobs_dir: String,
    /// Maximum number of jobs in flight per manager
    pub max_jobs: usize,
    /// Deadline for a single job, and for a batch to drain
    pub job_timeout_secs: u64,
    /// Poll interval while admission control is saturated
    pub admission_poll_ms: u64,
    /// Safety-net wait between claim scans when no job is eligible
    pub claim_wait_ms: u64,
    /// Safety-net wait between precursor checks in the lock
    pub lock_wait_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            jobs_dir: "jobs".to_string(),
            max_jobs: 10,
            job_timeout_secs: 600,
            admission_poll_ms: 100,
            claim_wait_ms: 10_000,
            lock_wait_ms: 5_000,
        }
    }
}

impl JobsConfig {
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn admission_poll(&self) -> Duration {
        Duration::from_millis(self.admission_poll_ms)
    }

    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.claim_wait_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

/// Shared and node-local temporary locations.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory on the shared filesystem holding per-job results
    pub shared_tmp: PathBuf,
    /// Node-local directory where the scan process writes its output
    pub local_tmp: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shared_tmp: PathBuf::from("/tmp/sharddist/shared"),
            local_tmp: PathBuf::from("/tmp/sharddist/local"),
        }
    }
}

/// External scan process run by workers.
///
/// Invoked as `program [extra_flags] <output_flag> <output> args.. filter`
/// with the shard piped to stdin.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub program: PathBuf,
    pub extra_flags: Vec<String>,
    pub output_flag: String,
    /// Pipe buffer size in bytes
    pub buf_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("sharddist-scan"),
            extra_flags: Vec::new(),
            output_flag: "-w".to_string(),
            buf_size: 64 * 1024,
        }
    }
}

/// External merge process run by the manager's combiner.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub program: PathBuf,
    /// Pipe buffer size in bytes
    pub buf_size: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("sharddist-merge"),
            buf_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity matched against a job's candidate hosts.
    /// Must equal the name the filesystem uses for this data node.
    pub host: String,
    /// Number of jobs executed concurrently
    pub concurrency: usize,
    pub coord: CoordConfig,
    pub jobs: JobsConfig,
    pub storage: StorageConfig,
    pub scan: ScanConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            concurrency: 4,
            coord: CoordConfig::default(),
            jobs: JobsConfig::default(),
            storage: StorageConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub coord: CoordConfig,
    pub jobs: JobsConfig,
    pub storage: StorageConfig,
    pub merge: MergeConfig,
    /// Program used when a batch is answered without distributing jobs
    pub direct: MergeConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            coord: CoordConfig::default(),
            jobs: JobsConfig::default(),
            storage: StorageConfig::default(),
            merge: MergeConfig::default(),
            direct: MergeConfig {
                program: PathBuf::from("sharddist-scan"),
                ..MergeConfig::default()
            },
        }
    }
}

/// Development coordination server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Upper bound on session timeouts requested by clients
    pub max_session_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:2281"
                .parse()
                .expect("default listen address is valid"),
            max_session_timeout_ms: 60_000,
        }
    }
}
