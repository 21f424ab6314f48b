//! Configure tracing subscribers for rpcswitch.

use std::path::Path;
use std::str::FromStr as _;

use anyhow::{Context as _, Result, anyhow};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, filter::Targets, fmt, registry};

use crate::cfg::{LogfileConfig, LoggingConfig};

/// As [`Targets::from_str`], but wrapped in an [`anyhow::Result`] that
/// names where the bad filter came from.
fn filt_from_str_verbose(s: &str, source: &str) -> Result<Targets> {
    Targets::from_str(s).with_context(|| format!("in {}", source))
}

/// Try to construct a tracing [`Layer`] for logging to stdout.
fn console_layer<S>(config: &LoggingConfig, cli: Option<&str>) -> Result<impl Layer<S>>
where
    S: Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let filter = match (cli, &config.console) {
        (Some(s), _) => filt_from_str_verbose(s, "--log-level command line parameter")?,
        (None, Some(s)) => filt_from_str_verbose(s, "logging.console")?,
        (None, None) => Targets::from_str("info").expect("bad default"),
    };
    Ok(fmt::Layer::default().with_filter(filter))
}

/// Try to construct a non-blocking tracing [`Layer`] writing to a logfile.
///
/// On success, return that layer along with a [`WorkerGuard`] that needs
/// to be dropped when the program exits, to flush buffered messages.
fn logfile_layer<S>(
    config: &LogfileConfig,
    fallback_filter: Option<&str>,
) -> Result<(impl Layer<S> + Send + Sync + Sized, WorkerGuard)>
where
    S: Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span> + Send + Sync,
{
    use tracing_appender::non_blocking;

    let filter = config
        .filter
        .as_deref()
        .or(fallback_filter)
        .unwrap_or("info");
    let filter = filt_from_str_verbose(filter, "logging.file.filter")?;

    let directory = config.path.parent().unwrap_or_else(|| Path::new("."));
    let fname = config
        .path
        .file_name()
        .ok_or_else(|| anyhow!("no file name in logging.file.path"))
        .map(Path::new)?;
    let appender = tracing_appender::rolling::never(directory, fname);
    let (nonblocking, guard) = non_blocking(appender);
    let layer = fmt::layer().with_writer(nonblocking).with_filter(filter);
    Ok((layer, guard))
}

/// Opaque structure that gets dropped when the program is shutting down,
/// after logs are no longer needed.  The `Drop` impl flushes buffered
/// messages.
pub(crate) struct LogGuards {
    /// The actual guards we're holding on to.
    #[allow(unused)]
    guards: Vec<WorkerGuard>,
}

/// Set up logging.
///
/// The returned [`LogGuards`] must be dropped precisely when the program
/// quits.
pub(crate) fn setup_logging(config: &LoggingConfig, cli: Option<&str>) -> Result<LogGuards> {
    let registry = registry().with(console_layer(config, cli)?);

    let mut guards = Vec::new();
    let file_layer = match &config.file {
        Some(file) => {
            let (layer, guard) = logfile_layer(file, config.console.as_deref())?;
            guards.push(guard);
            Some(layer)
        }
        None => None,
    };
    registry.with(file_layer).init();

    Ok(LogGuards { guards })
}
