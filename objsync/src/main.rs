use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use common::filter::{FilterChain, FilterVerb};
use common::location::Location;
use common::pipeline::{self, Command, Parameters, Report};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "objsync",
    version,
    about = "Copy, move and sync files between local directories and object storage buckets",
    long_about = "`objsync` transfers large sets of files between local directory trees and buckets.

Remote locations are written as s3://bucket/key. Buckets are directories under --store-root.

EXAMPLES:
    # Mirror a directory into a bucket, removing objects that no longer exist locally
    objsync --store-root /srv/buckets sync ./site s3://www/ --delete

    # Download everything except logs
    objsync --store-root /srv/buckets cp s3://data/ ./data --recursive --exclude '*.log'

Exit status is 0 on success, 1 if any file or object failed and 2 if the command itself failed."
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Directory holding one subdirectory per bucket
    #[arg(
        long,
        env = "OBJSYNC_STORE_ROOT",
        value_name = "DIR",
        global = true,
        help_heading = "Storage"
    )]
    store_root: Option<std::path::PathBuf>,

    // Transfer options
    /// Show what would be done without changing anything
    #[arg(long, alias = "dry-run", global = true, help_heading = "Transfer options")]
    dryrun: bool,

    /// Treat files as unchanged when their sizes match, ignoring timestamps
    #[arg(long, global = true, help_heading = "Transfer options")]
    size_only: bool,

    /// How much newer a source must be before it is considered changed
    ///
    /// Accepts a human readable duration, e.g. "2s", "1min".
    #[arg(
        long,
        default_value = "0s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        global = true,
        help_heading = "Transfer options"
    )]
    clock_skew: std::time::Duration,

    /// Do not follow symlinks when walking local directories
    #[arg(long, global = true, help_heading = "Transfer options")]
    no_follow_symlinks: bool,

    /// Payloads of at least this size are transferred in parts
    #[arg(
        long,
        default_value = "8MiB",
        value_name = "SIZE",
        global = true,
        help_heading = "Transfer options"
    )]
    multipart_threshold: bytesize::ByteSize,

    /// Size of each part of a multipart transfer
    #[arg(
        long,
        default_value = "8MiB",
        value_name = "SIZE",
        global = true,
        help_heading = "Transfer options"
    )]
    multipart_chunksize: bytesize::ByteSize,

    /// Attempts per part before a multipart transfer is aborted
    #[arg(
        long,
        default_value = "5",
        value_name = "N",
        global = true,
        help_heading = "Transfer options"
    )]
    part_retries: u32,

    /// Delay before retrying a failed part, doubled after every attempt
    #[arg(
        long,
        default_value = "200ms",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        global = true,
        help_heading = "Transfer options"
    )]
    retry_delay: std::time::Duration,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        global = true,
        help_heading = "Progress & output"
    )]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't print status lines or errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Number of files or objects transferred concurrently
    #[arg(
        long,
        default_value = "10",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    max_concurrent_requests: usize,

    /// Number of parts of a single file transferred concurrently
    #[arg(
        long,
        default_value = "4",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    max_part_concurrency: usize,

    /// Number of entries buffered between listing and transferring
    #[arg(
        long,
        default_value = "1000",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    queue_depth: usize,

    /// Maximum number of open local files, 0 means no limit
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    max_open_files: usize,

    /// Throttle the number of storage requests per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Throttle the number of transferred chunks per second, 0 means no throttle
    ///
    /// The number of chunks of a payload is calculated as: ((size - 1) / chunk size) + 1
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    /// Chunk size used to count transferred chunks
    ///
    /// Modifying this setting to a value > 0 is REQUIRED when using --iops-throttle.
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        global = true,
        help_heading = "Performance & throttling"
    )]
    chunk_size: u64,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

#[derive(Args, Debug, Clone)]
struct FilterArgs {
    /// Include paths matching PATTERN (can be specified multiple times)
    ///
    /// --include and --exclude are evaluated in the order given; the last pattern that matches a
    /// path decides whether it is included. Paths matching no pattern are included.
    #[arg(
        long,
        value_name = "PATTERN",
        action = clap::ArgAction::Append,
        help_heading = "Filtering"
    )]
    include: Vec<String>,

    /// Exclude paths matching PATTERN (can be specified multiple times)
    #[arg(
        long,
        value_name = "PATTERN",
        action = clap::ArgAction::Append,
        help_heading = "Filtering"
    )]
    exclude: Vec<String>,

    /// Read --include/--exclude lines from a file
    #[arg(
        long,
        value_name = "PATH",
        conflicts_with_all = ["include", "exclude"],
        help_heading = "Filtering"
    )]
    filter_file: Option<std::path::PathBuf>,

    /// Make `*` stop at `/`, use `**` to match across directories
    #[arg(long, help_heading = "Filtering")]
    literal_separator: bool,
}

#[derive(Args, Debug, Clone)]
struct TransferArgs {
    /// Source path or s3://bucket/key
    src: String,
    /// Destination path or s3://bucket/key
    dest: String,
    /// Transfer everything under the source
    #[arg(short = 'r', long)]
    recursive: bool,
    #[command(flatten)]
    filters: FilterArgs,
}

#[derive(Args, Debug, Clone)]
struct SyncArgs {
    /// Source directory or s3://bucket/prefix
    src: String,
    /// Destination directory or s3://bucket/prefix
    dest: String,
    /// Remove destination files that do not exist in the source
    #[arg(long)]
    delete: bool,
    #[command(flatten)]
    filters: FilterArgs,
}

#[derive(Args, Debug, Clone)]
struct RmArgs {
    /// s3://bucket/key or, with --recursive, s3://bucket/prefix
    path: String,
    /// Remove everything under the prefix
    #[arg(short = 'r', long)]
    recursive: bool,
    #[command(flatten)]
    filters: FilterArgs,
}

#[derive(Args, Debug, Clone)]
struct BucketArgs {
    /// s3://bucket
    path: String,
}

#[derive(Args, Debug, Clone)]
struct RbArgs {
    /// s3://bucket
    path: String,
    /// Delete every object in the bucket before removing it
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Copy a file or object, or a whole tree with --recursive
    Cp(TransferArgs),
    /// Like cp, then remove the source
    Mv(TransferArgs),
    /// Remove an object, or every object under a prefix with --recursive
    Rm(RmArgs),
    /// Make the destination match the source, transferring only what changed
    Sync(SyncArgs),
    /// Make a bucket
    Mb(BucketArgs),
    /// Remove an empty bucket, or any bucket with --force
    Rb(RbArgs),
}

/// Collects --include/--exclude values in the order they appeared on the command line.
fn ordered_patterns(matches: &clap::ArgMatches) -> Vec<(FilterVerb, String)> {
    let Some((_, sub_matches)) = matches.subcommand() else {
        return vec![];
    };
    let mut ordered = vec![];
    for (id, verb) in [
        ("include", FilterVerb::Include),
        ("exclude", FilterVerb::Exclude),
    ] {
        // mb and rb take no filters
        let Ok(Some(values)) = sub_matches.try_get_many::<String>(id) else {
            continue;
        };
        let Some(indices) = sub_matches.indices_of(id) else {
            continue;
        };
        ordered.extend(
            indices
                .zip(values)
                .map(|(index, pattern)| (index, verb, pattern.clone())),
        );
    }
    ordered.sort_by_key(|(index, _, _)| *index);
    ordered
        .into_iter()
        .map(|(_, verb, pattern)| (verb, pattern))
        .collect()
}

fn build_filters(args: &FilterArgs, patterns: &[(FilterVerb, String)]) -> Result<FilterChain> {
    if let Some(path) = &args.filter_file {
        return FilterChain::from_file(path, args.literal_separator);
    }
    let mut chain = if args.literal_separator {
        FilterChain::with_literal_separator()
    } else {
        FilterChain::new()
    };
    for (verb, pattern) in patterns {
        chain
            .add(*verb, pattern)
            .with_context(|| format!("invalid {} pattern {:?}", verb, pattern))?;
    }
    Ok(chain)
}

fn command_parameters(
    cmd: &Cmd,
    patterns: &[(FilterVerb, String)],
) -> Result<(Command, Parameters)> {
    let (command, parameters) = match cmd {
        Cmd::Cp(args) | Cmd::Mv(args) => {
            let command = if matches!(cmd, Cmd::Cp(_)) {
                Command::Cp
            } else {
                Command::Mv
            };
            let mut parameters =
                Parameters::new(Location::parse(&args.src)?, Some(Location::parse(&args.dest)?));
            parameters.recursive = args.recursive;
            parameters.filters = build_filters(&args.filters, patterns)?;
            (command, parameters)
        }
        Cmd::Sync(args) => {
            let mut parameters =
                Parameters::new(Location::parse(&args.src)?, Some(Location::parse(&args.dest)?));
            parameters.recursive = true;
            parameters.delete = args.delete;
            parameters.filters = build_filters(&args.filters, patterns)?;
            (Command::Sync, parameters)
        }
        Cmd::Rm(args) => {
            let mut parameters = Parameters::new(Location::parse(&args.path)?, None);
            parameters.recursive = args.recursive;
            parameters.filters = build_filters(&args.filters, patterns)?;
            (Command::Rm, parameters)
        }
        Cmd::Mb(args) => (Command::Mb, Parameters::new(Location::parse(&args.path)?, None)),
        Cmd::Rb(args) => {
            let mut parameters = Parameters::new(Location::parse(&args.path)?, None);
            parameters.force = args.force;
            (Command::Rb, parameters)
        }
    };
    Ok((command, parameters))
}

#[instrument(skip_all)]
async fn async_main(
    args: Cli,
    patterns: Vec<(FilterVerb, String)>,
    throttle: Arc<throttle::Throttle>,
) -> Result<Report> {
    let (command, mut parameters) = command_parameters(&args.command, &patterns)?;
    parameters.dry_run = args.dryrun;
    let pipeline = pipeline::build_pipeline(command, parameters)?;
    let store_root = args.store_root.ok_or_else(|| {
        anyhow!("no storage configured, pass --store-root or set OBJSYNC_STORE_ROOT")
    })?;
    let config = common::TransferConfig {
        max_concurrent_requests: args.max_concurrent_requests,
        queue_depth: args.queue_depth,
        multipart_threshold: args.multipart_threshold.as_u64(),
        multipart_chunksize: args.multipart_chunksize.as_u64(),
        max_part_concurrency: args.max_part_concurrency,
        part_retries: args.part_retries,
        retry_delay: args.retry_delay,
        clock_skew: args.clock_skew,
        size_only: args.size_only,
        follow_symlinks: !args.no_follow_symlinks,
    };
    config.validate().map_err(|error| anyhow!(error))?;
    let cancel = tokio_util::sync::CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::error!("interrupted, waiting for in-flight transfers to stop");
                cancel.cancel();
            }
        }
    });
    let ctx = common::executor::TransferContext::new(
        Arc::new(common::storage::fs::FsStore::new(store_root)),
        config,
        throttle,
        cancel,
    );
    let sink = common::status::StatusSink::Stdio { quiet: args.quiet };
    Ok(pipeline::run(&pipeline, ctx, sink).await)
}

fn main() {
    let matches = Cli::command().get_matches();
    let args = match Cli::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(error) => error.exit(),
    };
    let patterns = ordered_patterns(&matches);
    let func = {
        let args = args.clone();
        |throttle| async_main(args, patterns, throttle)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || args.verbose > 0,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: args.ops_throttle,
        iops_throttle: args.iops_throttle,
        chunk_size: args.chunk_size,
    };
    let exit_code = match common::run(output, runtime, throttle, func) {
        Some(report) => {
            if let Some(error) = &report.error {
                if !args.quiet {
                    eprintln!("objsync: {error}");
                }
            }
            report.exit_code()
        }
        None => 2,
    };
    std::process::exit(exit_code);
}
