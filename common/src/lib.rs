//! Engine behind `objsync`: keeps local trees and object storage buckets in sync
//!
//! Every command is a [`pipeline::Pipeline`] of stages connected by bounded channels:
//!
//! - [`generator`] lists a local tree or a remote prefix, in byte order of the relative key
//! - [`filter`] drops entries by `--include`/`--exclude` patterns, last match wins
//! - [`compare`] merge-joins the source and destination listings of `sync`
//! - [`executor`] runs entries on a bounded pool of workers, large payloads through [`multipart`]
//! - [`status`] prints one line per finished entry from a single writer task
//!
//! Storage is reached through the [`storage::ObjectStore`] trait; [`storage::fs::FsStore`] backs
//! buckets with directories, [`storage::memory::MemoryStore`] keeps them in memory.
//!
//! # Exit codes
//!
//! `0` when every entry succeeded, `1` when at least one entry failed and `2` when the pipeline
//! itself failed (invalid paths, a failed listing, an interrupt).

use std::future::Future;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

pub mod compare;
pub mod config;
pub mod entry;
pub mod executor;
pub mod filter;
pub mod generator;
pub mod location;
pub mod multipart;
pub mod pipeline;
pub mod status;
pub mod storage;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig, TransferConfig};

fn init_tracing(output: &OutputConfig) {
    let level = match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Sets up logging and the tokio runtime, then drives `func` to completion.
///
/// Returns `None` when setup failed or `func` returned an error; the error has been printed
/// already unless `output.quiet` is set. On success the result is printed when
/// `output.print_summary` is set.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    func: impl FnOnce(Arc<throttle::Throttle>) -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output);
    let report_error = |message: String| {
        if !output.quiet {
            eprintln!("{message}");
        }
    };
    if let Err(error) = throttle.validate() {
        report_error(error);
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            report_error(format!("failed to start the tokio runtime: {error}"));
            return None;
        }
    };
    let throttle = Arc::new(throttle::Throttle::new(throttle.limits()));
    match runtime.block_on(func(throttle)) {
        Ok(summary) => {
            if output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            report_error(format!("{error:#}"));
            None
        }
    }
}
