//! Active RTT/TTFB/throughput measurement engine for three-hop overlay
//! circuits.
//!
//! The binary entry point (`src/main.rs`) just calls [`run`]; this
//! crate root exists so integration tests and the binary share the
//! same module tree.

pub mod archive;
pub mod config;
pub mod control;
pub mod dest;
pub mod error;
pub mod http;
pub mod node;
pub mod process;
pub mod record;
pub mod sampler;
pub mod scheduler;
pub mod socks;
pub mod trace;
pub mod worker;

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};

use config::Cli;
use control::ControlClient;
use dest::DestAllocator;
use error::FatalError;
use sampler::PathSampler;
use scheduler::Scheduler;
use worker::WorkerShared;

/// Destination budget handed to each run's [`DestAllocator`]: every
/// address in `127.0.0.0/8`.
const DEST_BUDGET: u32 = 1 << 24;

/// Parse configuration, bring up the control channel, and run the
/// scheduler until the requested number of circuits has been probed
/// or the process is interrupted.
pub async fn run() -> Result<(), FatalError> {
    let cli = Cli::load()?;
    let _log_guards = trace::setup_logging(&cli.log_level, cli.log_file.as_deref())
        .map_err(FatalError::Startup)?;
    process::use_max_file_limit();

    tracing::info!(
        host = %cli.host,
        port = cli.port,
        circuits = cli.circuits,
        "starting measurement engine"
    );

    let control = ControlClient::connect(&cli.host, cli.port).await?;
    control.reset_non_internal_circuits().await?;
    let prior_config = control
        .apply_startup_config(cli.rttprobes, cli.ttfbprobes)
        .await?;

    let sampler = PathSampler::new(control.clone());

    let (archive_tx, archive_rx) = mpsc::unbounded_channel();
    let archive_dir = cli.archive_dir.clone();
    let archive_prefix = cli.output.clone();
    let archive_handle = tokio::task::spawn_blocking(move || {
        match archive::ArchiveWriter::open(archive_dir, archive_prefix) {
            Ok(writer) => writer.run(archive_rx),
            Err(e) => tracing::error!(error = %e, "failed to open archive directory"),
        }
    });

    let worker_shared = Arc::new(WorkerShared {
        control: control.clone(),
        launch_lock: Arc::new(Mutex::new(())),
        perf_lock: Arc::new(Semaphore::new(1)),
        bw_lock: Arc::new(Semaphore::new(1)),
        socks_addr: (Ipv4Addr::new(127, 0, 0, 1), cli.socks_port),
        dest_allocator: Arc::new(DestAllocator::new(DEST_BUDGET)),
        archive_tx,
        rtt_iterations: cli.rttprobes,
        ttfb_iterations: cli.ttfbprobes,
        bw_iterations: cli.bwprobes,
        probesleep: cli.probesleep_duration(),
        ttfb_url: cli.ttfb_url.clone(),
        bw_url: cli.bw_url.clone(),
    });

    let scheduler = Scheduler::new(
        sampler,
        worker_shared,
        cli.threads,
        cli.circuits as u64,
        cli.anti_hammer_enabled(),
    );

    let result = tokio::select! {
        res = scheduler.run() => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Ok(())
        }
    };

    drop(scheduler);
    // Once every in-flight worker's clone of `archive_tx` is dropped,
    // the archive writer drains its queue and exits; join it so
    // buffered probes are flushed before the process exits.
    let _ = archive_handle.await;

    // Unconditional, even on interrupt (`spec.md` §5 cancellation).
    if let Err(e) = control.restore_startup_config(&prior_config).await {
        tracing::warn!(error = %e, "failed to restore control channel configuration");
    }

    result
}
