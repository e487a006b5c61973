//! Configure tracing subscribers for the measurement engine.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::Targets, fmt, registry, Layer};

/// As [`Targets::from_str`], but wrapped in an [`anyhow::Result`].
//
// (We use `Targets`, not `EnvFilter`, because every layer below needs
// its own filter rather than one global filter: see the comment in
// `setup_logging`.)
fn filt_from_str_verbose(s: &str, source: &str) -> Result<Targets> {
    Targets::from_str(s).with_context(|| format!("in {source}"))
}

/// Try to construct a tracing [`Layer`] for logging to stdout.
fn console_layer<S>(log_level: &str) -> Result<impl Layer<S>>
where
    S: Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let filter = filt_from_str_verbose(log_level, "--log-level")?;
    Ok(fmt::Layer::default().with_filter(filter))
}

/// Try to construct a non-blocking tracing [`Layer`] for writing data
/// to `log_file`, never rotated (rotation is the archive writer's job,
/// not the logger's).
///
/// On success, return that layer along with a [`WorkerGuard`] that
/// must be dropped when the program exits, to flush buffered messages.
fn logfile_layer<S>(
    log_file: &Path,
    log_level: &str,
) -> Result<(impl Layer<S> + Send + Sync + Sized, WorkerGuard)>
where
    S: Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span> + Send + Sync,
{
    use tracing_appender::{non_blocking, rolling::RollingFileAppender, rolling::Rotation};

    let filter = filt_from_str_verbose(log_level, "--log-level")?;
    let directory = log_file.parent().unwrap_or_else(|| Path::new("."));
    let fname = log_file
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("--log-file has no file name component"))?;

    let appender = RollingFileAppender::new(Rotation::NEVER, directory, fname);
    let (nonblocking, guard) = non_blocking(appender);
    let layer = fmt::layer().with_writer(nonblocking).with_filter(filter);
    Ok((layer, guard))
}

/// Opaque structure that gets dropped when the program is shutting
/// down, after logs are no longer needed. The `Drop` impl (inherited
/// from the contained [`WorkerGuard`]s) flushes buffered messages.
pub struct LogGuards {
    #[allow(unused)]
    guards: Vec<WorkerGuard>,
}

/// Set up logging: a console layer always, plus an optional rolling
/// logfile layer when `log_file` is given.
///
/// The returned [`LogGuards`] must be kept alive (and dropped only at
/// process exit) so buffered log messages get flushed.
pub fn setup_logging(log_level: &str, log_file: Option<&Path>) -> Result<LogGuards> {
    // The layers added here must not themselves be filters: see
    // https://docs.rs/tracing-subscriber/latest/tracing_subscriber/layer/index.html#global-filtering
    let registry = registry().with(console_layer(log_level)?);

    let mut guards = Vec::new();
    let file_layer = log_file
        .map(|path| logfile_layer(path, log_level))
        .transpose()?
        .map(|(layer, guard)| {
            guards.push(guard);
            layer
        });

    registry.with(file_layer).init();
    Ok(LogGuards { guards })
}
