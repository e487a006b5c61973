//! Command-line interface and optional TOML configuration layering.

use std::path::PathBuf;

use clap::{CommandFactory, Parser};
use serde::Deserialize;

use crate::error::FatalError;

/// Active RTT/TTFB/throughput measurement engine for three-hop overlay
/// circuits.
#[derive(Debug, Parser)]
#[command(name = "navigator", version, about)]
pub struct Cli {
    /// Total paths to probe.
    #[arg(long, default_value_t = 1)]
    pub circuits: i64,

    /// RTT iterations per circuit.
    #[arg(long, default_value_t = 1)]
    pub rttprobes: u32,

    /// TTFB iterations per circuit.
    #[arg(long, default_value_t = 1)]
    pub ttfbprobes: u32,

    /// BW iterations per circuit.
    #[arg(long, default_value_t = 1)]
    pub bwprobes: u32,

    /// Seconds between TTFB iterations.
    #[arg(long, default_value_t = 0.0)]
    pub probesleep: f64,

    /// Maximum concurrent workers.
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// Archive file prefix.
    #[arg(long, default_value = "probe_")]
    pub output: String,

    /// Enable the anti-hammer invariant (no overlapping probes through
    /// the same relay). On by default; redundant unless it follows a
    /// `--no-network-protection` earlier on the same command line.
    #[allow(dead_code)]
    #[arg(long, action = clap::ArgAction::SetTrue, overrides_with = "no_network_protection")]
    network_protection: bool,

    /// Disable the anti-hammer invariant.
    #[arg(long, action = clap::ArgAction::SetTrue, overrides_with = "network_protection")]
    no_network_protection: bool,

    /// Control channel port on localhost.
    #[arg(long, default_value_t = 9051)]
    pub port: u16,

    /// Overlay client control channel host. Zero-cost to expose since
    /// the control client already takes a host/port pair; `spec.md`
    /// hardcodes localhost.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Overlay client SOCKS listener port.
    #[arg(long, default_value_t = 9050)]
    pub socks_port: u16,

    /// Fixed URL used for TTFB (HEAD) probes.
    #[arg(long, default_value = "http://ttfb.navigator.invalid/")]
    pub ttfb_url: String,

    /// Fixed URL used for bulk-throughput (GET) probes.
    #[arg(long, default_value = "http://bw.navigator.invalid/bulk")]
    pub bw_url: String,

    /// Directory archived probe records are written to; `--output` is
    /// the file prefix within it.
    #[arg(long, default_value = "./archive")]
    pub archive_dir: PathBuf,

    /// Optional TOML configuration file; CLI flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level filter (e.g. `"info"`, `"navigator=debug,warn"`).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Optional rolling logfile path; console logging is always active.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Whether the anti-hammer invariant should be enforced, resolving
    /// the `--network-protection`/`--no-network-protection` pair: on by
    /// default, `overrides_with` ensures only the last flag given wins,
    /// so it's off only when `--no-network-protection` is the one that
    /// stuck.
    pub fn anti_hammer_enabled(&self) -> bool {
        !self.no_network_protection
    }

    /// `--probesleep` as a [`std::time::Duration`].
    pub fn probesleep_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.probesleep.max(0.0))
    }
}

/// The subset of [`Cli`] fields that may also be supplied via
/// `--config`, layered underneath whatever was passed on the command
/// line.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    socks_port: Option<u16>,
    threads: Option<usize>,
    rttprobes: Option<u32>,
    ttfbprobes: Option<u32>,
    bwprobes: Option<u32>,
    probesleep: Option<f64>,
    output: Option<String>,
    ttfb_url: Option<String>,
    bw_url: Option<String>,
    archive_dir: Option<PathBuf>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Parse `argv`, then layer in `--config`'s TOML file (if given)
    /// underneath any flags the user didn't explicitly pass, and
    /// validate the result.
    pub fn load() -> Result<Self, FatalError> {
        let mut cli = Cli::parse();
        if let Some(path) = cli.config.clone() {
            let settings = config::Config::builder()
                .add_source(config::File::from(path))
                .build()
                .map_err(|e| FatalError::Startup(anyhow::anyhow!("reading config file: {e}")))?;
            let file: FileConfig = settings
                .try_deserialize()
                .map_err(|e| FatalError::Startup(anyhow::anyhow!("parsing config file: {e}")))?;
            cli.apply_file_defaults(file);
        }
        cli.validate()?;
        Ok(cli)
    }

    fn apply_file_defaults(&mut self, file: FileConfig) {
        let matches = Cli::command().get_matches();
        if !matches.contains_id("host") {
            if let Some(v) = file.host {
                self.host = v;
            }
        }
        if !matches.contains_id("port") {
            if let Some(v) = file.port {
                self.port = v;
            }
        }
        if !matches.contains_id("socks_port") {
            if let Some(v) = file.socks_port {
                self.socks_port = v;
            }
        }
        if !matches.contains_id("threads") {
            if let Some(v) = file.threads {
                self.threads = v;
            }
        }
        if !matches.contains_id("rttprobes") {
            if let Some(v) = file.rttprobes {
                self.rttprobes = v;
            }
        }
        if !matches.contains_id("ttfbprobes") {
            if let Some(v) = file.ttfbprobes {
                self.ttfbprobes = v;
            }
        }
        if !matches.contains_id("bwprobes") {
            if let Some(v) = file.bwprobes {
                self.bwprobes = v;
            }
        }
        if !matches.contains_id("probesleep") {
            if let Some(v) = file.probesleep {
                self.probesleep = v;
            }
        }
        if !matches.contains_id("output") {
            if let Some(v) = file.output {
                self.output = v;
            }
        }
        if !matches.contains_id("ttfb_url") {
            if let Some(v) = file.ttfb_url {
                self.ttfb_url = v;
            }
        }
        if !matches.contains_id("bw_url") {
            if let Some(v) = file.bw_url {
                self.bw_url = v;
            }
        }
        if !matches.contains_id("archive_dir") {
            if let Some(v) = file.archive_dir {
                self.archive_dir = v;
            }
        }
        if !matches.contains_id("log_level") {
            if let Some(v) = file.log_level {
                self.log_level = v;
            }
        }
        if !matches.contains_id("log_file") {
            if let Some(v) = file.log_file {
                self.log_file = Some(v);
            }
        }
    }

    /// Reject arguments that would otherwise fail partway through a
    /// run, before any control-channel side effect is attempted.
    fn validate(&self) -> Result<(), FatalError> {
        if self.circuits <= 0 {
            return Err(FatalError::InvalidArgument(
                "--circuits must be a positive integer".into(),
            ));
        }
        if self.threads == 0 {
            return Err(FatalError::InvalidArgument(
                "--threads must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
