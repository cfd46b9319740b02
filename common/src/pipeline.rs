//! Composing and running the stages of one command
//!
//! [`build_pipeline`] is a pure mapping from a command and the shape of its parameters to an
//! ordered list of [`Stage`]s. [`run`] instantiates those stages as tasks connected by bounded
//! channels:
//!
//! ```text
//! generator(s) -> [filter] -> [comparator] -> executor workers -> status writer
//! ```
//!
//! A producer that fails records its error, cancels the run and only then closes its output
//! channel, so downstream stages never mistake a truncated stream for a complete one.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::compare::{self, CompareSettings, CompareSummary, Decision};
use crate::entry::{ConsumerGone, Entry, OperationKind};
use crate::executor::{Executor, TransferContext};
use crate::filter::FilterChain;
use crate::generator::{Generator, GeneratorSettings};
use crate::location::{Location, LocationKind, PathsType};
use crate::status::{self, StatusSink, Summary};
use crate::storage::ObjectStore;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Cp,
    Mv,
    Rm,
    Sync,
    Mb,
    Rb,
}

impl Command {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Cp => "cp",
            Command::Mv => "mv",
            Command::Rm => "rm",
            Command::Sync => "sync",
            Command::Mb => "mb",
            Command::Rb => "rb",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Clone, Debug)]
pub struct Parameters {
    pub src: Location,
    pub dest: Option<Location>,
    /// operate on everything under `src` instead of a single item
    pub recursive: bool,
    pub filters: FilterChain,
    pub dry_run: bool,
    /// sync only: remove destination entries that have no source
    pub delete: bool,
    /// rb only: delete every object in the bucket first
    pub force: bool,
}

impl Parameters {
    #[must_use]
    pub fn new(src: Location, dest: Option<Location>) -> Self {
        Self {
            src,
            dest,
            recursive: false,
            filters: FilterChain::new(),
            dry_run: false,
            delete: false,
            force: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Generator,
    SourceGenerator,
    DestinationGenerator,
    Filter,
    Comparator,
    Executor,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Stage::Generator => "listing",
            Stage::SourceGenerator => "source listing",
            Stage::DestinationGenerator => "destination listing",
            Stage::Filter => "filter",
            Stage::Comparator => "comparison",
            Stage::Executor => "executor",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{command}: {reason}")]
    InvalidPaths { command: Command, reason: String },
    #[error("{stage} failed: {error:#}")]
    Producer {
        stage: Stage,
        #[source]
        error: anyhow::Error,
    },
    #[error("interrupted")]
    Cancelled,
}

/// A validated command, ready to be run.
#[derive(Clone, Debug)]
pub struct Pipeline {
    pub command: Command,
    pub parameters: Parameters,
    pub stages: Vec<Stage>,
    pub paths_type: PathsType,
    /// verb of the entries handed to the executor (for sync: of the transfers)
    pub operation: OperationKind,
}

impl Pipeline {
    #[must_use]
    pub fn has_stage(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }
}

fn invalid(command: Command, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidPaths {
        command,
        reason: reason.into(),
    }
}

fn transfer_operation(
    command: Command,
    paths_type: PathsType,
) -> Result<OperationKind, PipelineError> {
    match paths_type {
        PathsType::LocalToRemote | PathsType::RemoteToLocal | PathsType::RemoteToRemote
            if command == Command::Mv =>
        {
            Ok(OperationKind::Move)
        }
        PathsType::LocalToRemote => Ok(OperationKind::Upload),
        PathsType::RemoteToLocal => Ok(OperationKind::Download),
        PathsType::RemoteToRemote => Ok(OperationKind::Copy),
        PathsType::LocalToLocal => Err(invalid(
            command,
            "at least one of the paths must be an s3:// location",
        )),
        PathsType::Local | PathsType::Remote => Err(invalid(
            command,
            "both a source and a destination are required",
        )),
    }
}

fn single_remote(command: Command, parameters: &Parameters) -> Result<PathsType, PipelineError> {
    match PathsType::of(&parameters.src, parameters.dest.as_ref()) {
        PathsType::Remote => Ok(PathsType::Remote),
        PathsType::Local => Err(invalid(command, "the path must be an s3:// location")),
        _ => Err(invalid(command, "takes exactly one path")),
    }
}

/// Maps a command and the shape of its parameters to the stages that implement it.
///
/// Performs no I/O. Any include/exclude pattern gets a filter stage, also for a single item,
/// whose `compare_key` is its file name.
pub fn build_pipeline(
    command: Command,
    parameters: Parameters,
) -> Result<Pipeline, PipelineError> {
    let filtered = !parameters.filters.is_empty();
    let (paths_type, operation, stages) = match command {
        Command::Cp | Command::Mv => {
            let paths_type = PathsType::of(&parameters.src, parameters.dest.as_ref());
            let operation = transfer_operation(command, paths_type)?;
            let stages = if filtered {
                vec![Stage::Generator, Stage::Filter, Stage::Executor]
            } else {
                vec![Stage::Generator, Stage::Executor]
            };
            (paths_type, operation, stages)
        }
        Command::Sync => {
            let paths_type = PathsType::of(&parameters.src, parameters.dest.as_ref());
            let operation = transfer_operation(command, paths_type)?;
            let mut stages = vec![Stage::SourceGenerator, Stage::DestinationGenerator];
            if filtered {
                stages.push(Stage::Filter);
            }
            stages.extend([Stage::Comparator, Stage::Executor]);
            (paths_type, operation, stages)
        }
        Command::Rm => {
            let paths_type = single_remote(command, &parameters)?;
            let stages = if filtered {
                vec![Stage::Generator, Stage::Filter, Stage::Executor]
            } else {
                vec![Stage::Generator, Stage::Executor]
            };
            (paths_type, OperationKind::Delete, stages)
        }
        Command::Mb | Command::Rb => {
            let paths_type = single_remote(command, &parameters)?;
            if let Location::Remote { key, .. } = &parameters.src {
                if !key.is_empty() {
                    return Err(invalid(command, "expects a bucket name, not an object key"));
                }
            }
            if filtered {
                return Err(invalid(command, "bucket operations take no filters"));
            }
            let (operation, stages) = match command {
                Command::Mb if parameters.force => {
                    return Err(invalid(command, "--force only applies to rb"));
                }
                Command::Mb => (OperationKind::MakeBucket, vec![Stage::Executor]),
                // the bucket is emptied by a listing of deletions first
                _ if parameters.force => (
                    OperationKind::RemoveBucket,
                    vec![Stage::Generator, Stage::Executor],
                ),
                _ => (OperationKind::RemoveBucket, vec![Stage::Executor]),
            };
            (paths_type, operation, stages)
        }
    };
    Ok(Pipeline {
        command,
        parameters,
        stages,
        paths_type,
        operation,
    })
}

/// What a finished run reports back to the caller.
#[derive(Debug)]
pub struct Report {
    pub summary: Summary,
    /// sync only
    pub comparison: Option<CompareSummary>,
    pub error: Option<PipelineError>,
}

impl Report {
    /// 0 when everything succeeded, 1 when some entry failed, 2 when the pipeline itself failed.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.error.is_some() {
            2
        } else if self.summary.has_failures() {
            1
        } else {
            0
        }
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(comparison) = &self.comparison {
            writeln!(
                f,
                "compared: {} unchanged, {} to transfer, {} to delete, {} kept",
                comparison[Decision::Same],
                comparison[Decision::Transfer],
                comparison[Decision::Delete],
                comparison[Decision::Skip]
            )?;
        }
        write!(f, "{}", self.summary)
    }
}

/// Shared by the producer tasks of one run.
#[derive(Clone)]
struct Control {
    cancel: CancellationToken,
    errors: mpsc::UnboundedSender<(Stage, anyhow::Error)>,
}

impl Control {
    /// Must be called while the stage still holds its output sender.
    fn settle<T>(&self, stage: Stage, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                if error.downcast_ref::<ConsumerGone>().is_some() {
                    tracing::debug!("{}: {:#}", stage, error);
                } else {
                    tracing::error!("{} failed: {:#}", stage, error);
                    let _ = self.errors.send((stage, error));
                }
                self.cancel.cancel();
                None
            }
        }
    }
}

fn spawn_generator(
    control: &Control,
    stage: Stage,
    generator: Generator,
    tx: mpsc::Sender<Entry>,
) -> tokio::task::JoinHandle<()> {
    let control = control.clone();
    tokio::spawn(async move {
        let result = generator.run(&tx).await;
        control.settle(stage, result);
        drop(tx);
    })
}

async fn filter_entries(
    mut rx: mpsc::Receiver<Entry>,
    tx: &mpsc::Sender<Entry>,
    filters: &FilterChain,
) -> Result<()> {
    while let Some(entry) = rx.recv().await {
        let result = filters.evaluate(&entry.compare_key);
        if !result.is_included() {
            tracing::debug!("{}: {:?}", entry.compare_key, result);
            continue;
        }
        tx.send(entry)
            .await
            .map_err(|_| ConsumerGone("filtered entry consumer"))?;
    }
    Ok(())
}

/// Returns the sender producers should write to so that their entries reach `out`, through a
/// filter task when the pipeline has a filter stage.
fn filter_into(
    control: &Control,
    pipeline: &Pipeline,
    out: mpsc::Sender<Entry>,
    depth: usize,
    tasks: &mut Vec<tokio::task::JoinHandle<()>>,
) -> mpsc::Sender<Entry> {
    if !pipeline.has_stage(Stage::Filter) {
        return out;
    }
    let (tx, rx) = mpsc::channel(depth);
    let filters = pipeline.parameters.filters.clone();
    let control = control.clone();
    tasks.push(tokio::spawn(async move {
        let result = filter_entries(rx, &out, &filters).await;
        control.settle(Stage::Filter, result);
        drop(out);
    }));
    tx
}

fn generator_settings(pipeline: &Pipeline, follow_symlinks: bool) -> GeneratorSettings {
    let parameters = &pipeline.parameters;
    GeneratorSettings {
        root: parameters.src.clone(),
        dest: parameters.dest.clone(),
        operation: pipeline.operation,
        dir_op: parameters.recursive || pipeline.command == Command::Sync,
        include_markers: pipeline.command == Command::Rm,
        follow_symlinks,
        missing_root_ok: false,
    }
}

/// Runs a built pipeline to completion.
///
/// Status lines go to `sink` as entries finish. Cancelling `ctx.cancel` stops all stages from
/// taking new work; in-flight multipart transfers are aborted.
#[instrument(skip_all, fields(command = %pipeline.command))]
pub async fn run(pipeline: &Pipeline, ctx: TransferContext, sink: StatusSink) -> Report {
    let depth = ctx.config.queue_depth.max(1);
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let control = Control {
        cancel: ctx.cancel.clone(),
        errors: errors_tx,
    };
    let replenish = {
        let throttle = ctx.throttle.clone();
        tokio::spawn(async move { throttle.run_replenish().await })
    };
    let (status_tx, status_rx) = mpsc::channel(depth);
    let writer = tokio::spawn(status::write_status(status_rx, sink));
    let (exec_tx, exec_rx) = mpsc::channel(depth);
    let emptying_status =
        (pipeline.command == Command::Rb && pipeline.has_stage(Stage::Generator))
            .then(|| status_tx.clone());
    let executor = tokio::spawn(
        Executor::new(ctx.clone(), pipeline.parameters.dry_run).run(exec_rx, status_tx),
    );
    let store: Arc<dyn ObjectStore> = ctx.store.clone();
    let mut tasks = vec![];
    let mut comparator = None;
    match pipeline.command {
        Command::Cp | Command::Mv | Command::Rm => {
            let settings = generator_settings(pipeline, ctx.config.follow_symlinks);
            let generator = Generator::new(settings, store, ctx.throttle.clone());
            let tx = filter_into(&control, pipeline, exec_tx, depth, &mut tasks);
            tasks.push(spawn_generator(&control, Stage::Generator, generator, tx));
        }
        Command::Sync => {
            let src_settings = generator_settings(pipeline, ctx.config.follow_symlinks);
            let dest_root = pipeline
                .parameters
                .dest
                .clone()
                .unwrap_or_else(|| pipeline.parameters.src.clone());
            let dst_settings = GeneratorSettings {
                root: dest_root.clone(),
                dest: None,
                operation: OperationKind::Delete,
                dir_op: true,
                include_markers: pipeline.parameters.delete,
                follow_symlinks: ctx.config.follow_symlinks,
                // syncing into a local directory that does not exist yet
                missing_root_ok: dest_root.kind() == LocationKind::Local,
            };
            let (src_tx, src_rx) = mpsc::channel(depth);
            let (dst_tx, dst_rx) = mpsc::channel(depth);
            let src_tx = filter_into(&control, pipeline, src_tx, depth, &mut tasks);
            let dst_tx = filter_into(&control, pipeline, dst_tx, depth, &mut tasks);
            tasks.push(spawn_generator(
                &control,
                Stage::SourceGenerator,
                Generator::new(src_settings, store.clone(), ctx.throttle.clone()),
                src_tx,
            ));
            tasks.push(spawn_generator(
                &control,
                Stage::DestinationGenerator,
                Generator::new(dst_settings, store, ctx.throttle.clone()),
                dst_tx,
            ));
            let settings = CompareSettings {
                delete: pipeline.parameters.delete,
                size_only: ctx.config.size_only,
                clock_skew: ctx.config.clock_skew,
            };
            let control = control.clone();
            comparator = Some(tokio::spawn(async move {
                let result =
                    compare::compare(src_rx, dst_rx, &exec_tx, settings, &control.cancel).await;
                let summary = control.settle(Stage::Comparator, result);
                drop(exec_tx);
                summary
            }));
        }
        Command::Mb | Command::Rb => {
            let bucket = pipeline.parameters.src.bucket().unwrap_or_default();
            let entry = Entry::for_bucket(pipeline.operation, bucket);
            let emptying = emptying_status.map(|status_tx| {
                let settings = GeneratorSettings {
                    root: Location::remote(bucket, ""),
                    dest: None,
                    operation: OperationKind::Delete,
                    dir_op: true,
                    include_markers: true,
                    follow_symlinks: ctx.config.follow_symlinks,
                    missing_root_ok: false,
                };
                let (delete_tx, delete_rx) = mpsc::channel(depth);
                tasks.push(spawn_generator(
                    &control,
                    Stage::Generator,
                    Generator::new(settings, store, ctx.throttle.clone()),
                    delete_tx,
                ));
                tokio::spawn(
                    Executor::new(ctx.clone(), pipeline.parameters.dry_run)
                        .run(delete_rx, status_tx),
                )
            });
            let control = control.clone();
            tasks.push(tokio::spawn(async move {
                if let Some(deletions) = emptying {
                    let emptied = match deletions.await {
                        Ok(result) => result,
                        Err(error) => Err::<(), _>(error).context("executor task failed"),
                    };
                    if control.settle(Stage::Executor, emptied).is_none()
                        || control.cancel.is_cancelled()
                    {
                        drop(exec_tx);
                        return;
                    }
                }
                let sent: Result<()> = exec_tx
                    .send(entry)
                    .await
                    .map_err(|_| ConsumerGone("executor").into());
                control.settle(Stage::Executor, sent);
                drop(exec_tx);
            }));
        }
    }
    for task in tasks {
        if let Err(error) = task.await {
            control.settle::<()>(
                Stage::Executor,
                Err::<(), _>(error).context("pipeline task failed"),
            );
        }
    }
    let comparison = match comparator {
        Some(task) => match task.await {
            Ok(summary) => summary,
            Err(error) => {
                control.settle::<()>(
                    Stage::Comparator,
                    Err::<(), _>(error).context("comparator task failed"),
                );
                None
            }
        },
        None => None,
    };
    match executor.await {
        Ok(result) => {
            control.settle(Stage::Executor, result);
        }
        Err(error) => {
            control.settle::<()>(
                Stage::Executor,
                Err::<(), _>(error).context("executor task failed"),
            );
        }
    }
    let summary = match writer.await {
        Ok(summary) => summary,
        Err(error) => {
            control.settle::<()>(
                Stage::Executor,
                Err::<(), _>(error).context("status writer failed"),
            );
            Summary::default()
        }
    };
    replenish.abort();
    let cancelled = control.cancel.is_cancelled();
    drop(control);
    let error = match errors_rx.try_recv() {
        Ok((stage, error)) => Some(PipelineError::Producer { stage, error }),
        Err(_) if cancelled => Some(PipelineError::Cancelled),
        Err(_) => None,
    };
    if let Some(comparison) = &comparison {
        tracing::info!("sync decisions: {:?}", comparison);
    }
    Report {
        summary,
        comparison,
        error,
    }
}
