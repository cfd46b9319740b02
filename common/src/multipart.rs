//! Multipart transfers
//!
//! A payload is split into numbered parts of [`TransferConfig::part_size`] bytes (the last part
//! may be shorter). Parts run concurrently, up to `max_part_concurrency` at a time, and each part
//! is retried with exponential backoff. The transfer is finalized only after every part
//! succeeded. The first part that runs out of attempts, or a cancellation, stops the remaining
//! parts and aborts the transfer before the error is returned:
//!
//! - uploads and remote copies call `multipart_abort`, so no partial object is left behind
//! - downloads write into a temporary sibling file, finalized by a rename and aborted by
//!   removing it
//!
//! [`TransferConfig::part_size`]: crate::config::TransferConfig::part_size

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use crate::executor::TransferContext;
use crate::storage::{self, ByteRange, CompletedPart};

/// Suffix of in-progress download files, never picked up by local listings.
pub const TEMP_SUFFIX: &str = ".objsync-tmp";

/// Splits `size` bytes into `(part_number, range)` pairs, part numbers start at 1.
#[must_use]
pub fn plan_parts(size: u64, part_size: u64) -> Vec<(u32, ByteRange)> {
    let part_size = part_size.max(1);
    let mut parts = vec![];
    let mut start = 0;
    let mut part_number = 1;
    while start < size {
        let len = part_size.min(size - start);
        parts.push((part_number, ByteRange { start, len }));
        start += len;
        part_number += 1;
    }
    parts
}

/// Where part payloads are read from.
#[derive(Clone, Debug)]
pub enum PartSource {
    File(PathBuf),
    Object { bucket: String, key: String },
}

#[derive(Clone, Debug)]
enum PartTarget {
    Upload {
        bucket: String,
        key: String,
        upload_id: String,
    },
    File(PathBuf),
}

impl PartSource {
    async fn read(&self, ctx: &TransferContext, range: ByteRange) -> Result<bytes::Bytes> {
        match self {
            PartSource::File(path) => {
                let _permit = ctx.throttle.open_file_permit().await;
                let mut file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("failed opening {:?} for reading", path))?;
                file.seek(std::io::SeekFrom::Start(range.start))
                    .await
                    .with_context(|| format!("failed seeking in {:?}", path))?;
                let mut buf = vec![0; usize::try_from(range.len)?];
                file.read_exact(&mut buf).await.with_context(|| {
                    format!("failed reading {} bytes from {:?}", range.len, path)
                })?;
                Ok(bytes::Bytes::from(buf))
            }
            PartSource::Object { bucket, key } => {
                ctx.throttle.get_ops_token().await;
                let stream = ctx.store.get(bucket, key, Some(range)).await?;
                let body = storage::collect(stream)
                    .await
                    .with_context(|| format!("failed reading s3://{bucket}/{key}"))?;
                if body.len() as u64 != range.len {
                    return Err(anyhow!(
                        "short read from s3://{}/{}: expected {} bytes at offset {}, got {}",
                        bucket,
                        key,
                        range.len,
                        range.start,
                        body.len()
                    ));
                }
                Ok(body)
            }
        }
    }
}

impl PartTarget {
    async fn write(
        &self,
        ctx: &TransferContext,
        part_number: u32,
        range: ByteRange,
        body: bytes::Bytes,
    ) -> Result<Option<CompletedPart>> {
        ctx.throttle.get_transfer_tokens(range.len).await;
        match self {
            PartTarget::Upload {
                bucket,
                key,
                upload_id,
            } => {
                ctx.throttle.get_ops_token().await;
                let etag = ctx
                    .store
                    .multipart_upload_part(bucket, key, upload_id, part_number, body)
                    .await?;
                Ok(Some(CompletedPart { part_number, etag }))
            }
            PartTarget::File(path) => {
                let _permit = ctx.throttle.open_file_permit().await;
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(path)
                    .await
                    .with_context(|| format!("failed opening {:?} for writing", path))?;
                file.seek(std::io::SeekFrom::Start(range.start)).await?;
                file.write_all(&body)
                    .await
                    .with_context(|| format!("failed writing part {} to {:?}", part_number, path))?;
                file.flush().await?;
                Ok(None)
            }
        }
    }
}

async fn transfer_part(
    ctx: &TransferContext,
    source: &PartSource,
    target: &PartTarget,
    part_number: u32,
    range: ByteRange,
) -> Result<Option<CompletedPart>> {
    let mut delay = ctx.config.retry_delay;
    let mut attempt = 1;
    loop {
        let result = async {
            let body = source.read(ctx, range).await?;
            target.write(ctx, part_number, range, body).await
        }
        .await;
        match result {
            Ok(part) => return Ok(part),
            Err(error) if attempt < ctx.config.part_retries => {
                tracing::warn!(
                    "part {} attempt {}/{} failed: {:#}, retrying in {:?}",
                    part_number,
                    attempt,
                    ctx.config.part_retries,
                    error,
                    delay
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(error.context("transfer cancelled")),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(error) => {
                return Err(error.context(format!(
                    "part {} failed after {} attempts",
                    part_number, attempt
                )));
            }
        }
    }
}

async fn run_parts(
    ctx: &TransferContext,
    source: PartSource,
    target: PartTarget,
    size: u64,
) -> Result<Vec<CompletedPart>> {
    let plan = plan_parts(size, ctx.config.part_size(size));
    tracing::debug!("transferring {} bytes in {} parts", size, plan.len());
    let mut pending = plan.into_iter();
    let mut completed = vec![];
    let mut join_set = tokio::task::JoinSet::new();
    loop {
        while join_set.len() < ctx.config.max_part_concurrency {
            let Some((part_number, range)) = pending.next() else {
                break;
            };
            let ctx = ctx.clone();
            let source = source.clone();
            let target = target.clone();
            join_set.spawn(async move {
                transfer_part(&ctx, &source, &target, part_number, range).await
            });
        }
        let joined = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                join_set.shutdown().await;
                return Err(anyhow!("transfer cancelled"));
            }
            joined = join_set.join_next() => joined,
        };
        let Some(joined) = joined else {
            break;
        };
        let failure = match joined {
            Ok(Ok(Some(part))) => {
                completed.push(part);
                continue;
            }
            Ok(Ok(None)) => continue,
            Ok(Err(error)) => error,
            Err(error) => anyhow::Error::from(error).context("part task failed"),
        };
        // nothing may still be writing parts once the transfer is aborted
        join_set.shutdown().await;
        return Err(failure);
    }
    completed.sort_by_key(|part| part.part_number);
    Ok(completed)
}

/// Multipart upload (or remote copy) of `size` bytes from `source` to `s3://bucket/key`.
#[instrument(skip(ctx))]
pub async fn upload(
    ctx: &TransferContext,
    source: PartSource,
    bucket: &str,
    key: &str,
    size: u64,
) -> Result<()> {
    ctx.throttle.get_ops_token().await;
    let upload_id = ctx
        .store
        .multipart_init(bucket, key)
        .await
        .with_context(|| format!("failed starting multipart upload to s3://{bucket}/{key}"))?;
    let target = PartTarget::Upload {
        bucket: bucket.to_string(),
        key: key.to_string(),
        upload_id: upload_id.clone(),
    };
    let result = match run_parts(ctx, source, target, size).await {
        Ok(parts) => {
            ctx.throttle.get_ops_token().await;
            ctx.store
                .multipart_complete(bucket, key, &upload_id, parts)
                .await
                .map_err(anyhow::Error::from)
                .context("failed completing multipart upload")
        }
        Err(error) => Err(error),
    };
    if let Err(error) = result {
        tracing::debug!("aborting multipart upload {}", upload_id);
        if let Err(abort_error) = ctx.store.multipart_abort(bucket, key, &upload_id).await {
            tracing::error!(
                "failed aborting multipart upload {} to s3://{}/{}: {}",
                upload_id,
                bucket,
                key,
                abort_error
            );
        }
        return Err(error);
    }
    Ok(())
}

/// Temporary file next to `dest` used while parts are being written. Destinations are unique
/// within a run, so the process id is enough to keep concurrent runs apart.
pub fn temp_sibling(dest: &Path) -> Result<PathBuf> {
    let name = dest
        .file_name()
        .with_context(|| format!("{:?} has no file name", dest))?
        .to_string_lossy();
    Ok(dest.with_file_name(format!(
        ".{}.{}{}",
        name,
        std::process::id(),
        TEMP_SUFFIX
    )))
}

/// Multipart download of `s3://bucket/key` into `dest`.
#[instrument(skip(ctx))]
pub async fn download(
    ctx: &TransferContext,
    bucket: &str,
    key: &str,
    dest: &Path,
    size: u64,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed creating directory {:?}", parent))?;
    }
    let temp = temp_sibling(dest)?;
    {
        let _permit = ctx.throttle.open_file_permit().await;
        let file = tokio::fs::File::create(&temp)
            .await
            .with_context(|| format!("failed creating {:?}", temp))?;
        file.set_len(size)
            .await
            .with_context(|| format!("failed allocating {:?}", temp))?;
    }
    let source = PartSource::Object {
        bucket: bucket.to_string(),
        key: key.to_string(),
    };
    let result = match run_parts(ctx, source, PartTarget::File(temp.clone()), size).await {
        Ok(_) => tokio::fs::rename(&temp, dest)
            .await
            .with_context(|| format!("failed moving {:?} into place at {:?}", temp, dest)),
        Err(error) => Err(error),
    };
    if result.is_err() {
        if let Err(error) = tokio::fs::remove_file(&temp).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::error!("failed removing {:?}: {}", temp, error);
            }
        }
    }
    result
}
