use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use sharddist::config::{
    CoordConfig, JobsConfig, ManagerConfig, MergeConfig, ScanConfig, ServerConfig, StorageConfig,
    WorkerConfig,
};
use sharddist::coord::{MemoryTree, RemoteConnector};
use sharddist::manager::{load_manifest, BatchRequest, Manager};
use sharddist::server::CoordServer;
use sharddist::shutdown::install_shutdown_handler;
use sharddist::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "sharddist")]
#[command(version)]
#[command(about = "Distributed shard scans coordinated through a shared tree")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve an in-memory coordination tree over gRPC
    Coord(CoordServerArgs),

    /// Claim and run jobs for shards stored on this host
    Worker(WorkerArgs),

    /// Run one batch as manager, writing merged output to stdout
    Run(RunArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CoordArgs {
    /// Coordination server endpoint
    #[arg(long, default_value = "http://127.0.0.1:2281")]
    endpoint: String,

    /// Root node of the job tree
    #[arg(long, default_value = "/sharddist")]
    root: String,

    /// Session timeout in milliseconds
    #[arg(long, default_value = "10000")]
    session_timeout_ms: u64,
}

impl CoordArgs {
    fn into_config(self) -> CoordConfig {
        CoordConfig {
            endpoint: self.endpoint,
            root: self.root,
            session_timeout_ms: self.session_timeout_ms,
            ..CoordConfig::default()
        }
    }
}

#[derive(Parser, Debug)]
struct StorageArgs {
    /// Shared directory holding per-job results
    #[arg(long, default_value = "/tmp/sharddist/shared")]
    shared_tmp: PathBuf,

    /// Node-local directory for scan output
    #[arg(long, default_value = "/tmp/sharddist/local")]
    local_tmp: PathBuf,
}

impl StorageArgs {
    fn into_config(self) -> StorageConfig {
        StorageConfig {
            shared_tmp: self.shared_tmp,
            local_tmp: self.local_tmp,
        }
    }
}

// =============================================================================
// Subcommand Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CoordServerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "2281")]
    port: u16,

    /// Upper bound on client session timeouts, in milliseconds
    #[arg(long, default_value = "60000")]
    max_session_timeout_ms: u64,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Host name matched against each shard's replica hosts
    #[arg(long)]
    host: String,

    /// Maximum number of scans running at once
    #[arg(long, default_value = "4")]
    concurrency: usize,

    /// Scan program
    #[arg(long, default_value = "sharddist-scan")]
    scan_program: PathBuf,

    /// Flag preceding the output file path
    #[arg(long, default_value = "-w")]
    output_flag: String,

    /// Extra flag passed to every scan (repeatable)
    #[arg(long = "scan-flag")]
    scan_flags: Vec<String>,

    /// Per-job timeout in seconds
    #[arg(long, default_value = "600")]
    job_timeout_secs: u64,

    #[command(flatten)]
    coord: CoordArgs,

    #[command(flatten)]
    storage: StorageArgs,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSON manifest: [{"path": "...", "hosts": ["..."]}, ...]
    #[arg(long, required_unless_present = "no_files")]
    manifest: Option<PathBuf>,

    /// Filter expression passed to every program
    #[arg(long, default_value = "")]
    filter: String,

    /// Run the direct program once without input
    #[arg(long)]
    no_files: bool,

    /// Maximum number of jobs in flight
    #[arg(long, default_value = "10")]
    max_jobs: usize,

    /// Batch timeout in seconds
    #[arg(long, default_value = "600")]
    job_timeout_secs: u64,

    /// Merge program fed with every job's output
    #[arg(long, default_value = "sharddist-merge")]
    merge_program: PathBuf,

    /// Program used for single-shard and no-file batches
    #[arg(long, default_value = "sharddist-scan")]
    direct_program: PathBuf,

    /// Write the batch report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    #[command(flatten)]
    coord: CoordArgs,

    #[command(flatten)]
    storage: StorageArgs,

    /// Arguments passed through to the scan and merge programs
    #[arg(last = true)]
    program_args: Vec<String>,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_coord(args: CoordServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = ServerConfig {
        listen_addr,
        max_session_timeout_ms: args.max_session_timeout_ms,
    };

    let shutdown = install_shutdown_handler();
    CoordServer::new(config, MemoryTree::new())
        .run(shutdown)
        .await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let coord = args.coord.into_config();
    let connector = Arc::new(RemoteConnector::new(
        coord.endpoint.clone(),
        coord.session_timeout(),
    ));
    let config = WorkerConfig {
        coord,
        jobs: JobsConfig::default().with_job_timeout(Duration::from_secs(args.job_timeout_secs)),
        storage: args.storage.into_config(),
        scan: ScanConfig {
            program: args.scan_program,
            extra_flags: args.scan_flags,
            output_flag: args.output_flag,
            ..ScanConfig::default()
        },
        ..WorkerConfig::new(args.host)
    }
    .with_concurrency(args.concurrency);

    let shutdown = install_shutdown_handler();
    let worker = Worker::new(config, connector);
    worker.run(shutdown).await?;

    let stats = worker.stats();
    tracing::info!(
        claimed = stats.claimed(),
        succeeded = stats.succeeded(),
        failed = stats.failed(),
        reconnects = stats.reconnects(),
        "Worker stopped"
    );
    Ok(())
}

/// Returns the process exit code.
async fn run_batch(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let shards = match &args.manifest {
        Some(path) if !args.no_files => load_manifest(path).await?,
        _ => Vec::new(),
    };
    let coord = args.coord.into_config();
    let connector = Arc::new(RemoteConnector::new(
        coord.endpoint.clone(),
        coord.session_timeout(),
    ));
    let config = ManagerConfig {
        coord,
        jobs: JobsConfig::default()
            .with_max_jobs(args.max_jobs)
            .with_job_timeout(Duration::from_secs(args.job_timeout_secs)),
        storage: args.storage.into_config(),
        merge: MergeConfig {
            program: args.merge_program,
            ..MergeConfig::default()
        },
        direct: MergeConfig {
            program: args.direct_program,
            ..MergeConfig::default()
        },
    };
    let request = BatchRequest {
        args: args.program_args,
        filter: args.filter,
        shards,
        no_files: args.no_files,
    };

    let shutdown = install_shutdown_handler();
    let manager = Manager::new(config, connector);
    let report = manager
        .run(request, tokio::io::stdout(), tokio::io::stderr(), shutdown)
        .await?;

    if let Some(path) = &args.report {
        tokio::fs::write(path, report.to_json()?).await?;
    }

    Ok(if report.timed_out {
        2
    } else if report.succeeded() {
        0
    } else {
        1
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries batch output, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Coord(coord_args) => run_coord(coord_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Run(run_args) => {
            let code = run_batch(run_args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}
