//! Transfer engine: a bounded pool of workers executing entries
//!
//! Every entry is turned into a [`Task`] and dispatched by a single match in [`execute`]. The
//! [`Executor`] keeps at most `max_concurrent_requests` entries in flight and reports each one,
//! success or failure, as an [`Outcome`] to the status writer. A failing entry never stops its
//! siblings; only cancellation stops the pool from taking new entries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::TransferConfig;
use crate::entry::{Entry, OperationKind};
use crate::location::Location;
use crate::multipart::{self, PartSource};
use crate::status::Outcome;
use crate::storage::{ObjectStore, StorageError};

/// Everything a worker needs to execute entries, cheap to clone.
#[derive(Clone)]
pub struct TransferContext {
    pub store: Arc<dyn ObjectStore>,
    pub config: TransferConfig,
    pub throttle: Arc<throttle::Throttle>,
    pub cancel: CancellationToken,
}

impl TransferContext {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: TransferConfig,
        throttle: Arc<throttle::Throttle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            throttle,
            cancel,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transfer {
    Upload {
        src: PathBuf,
        bucket: String,
        key: String,
    },
    Download {
        bucket: String,
        key: String,
        dest: PathBuf,
    },
    Copy {
        src_bucket: String,
        src_key: String,
        bucket: String,
        key: String,
    },
}

impl Transfer {
    fn between(src: &Location, dest: &Location) -> Result<Self> {
        match (src, dest) {
            (Location::Local(src), Location::Remote { bucket, key }) => Ok(Transfer::Upload {
                src: src.clone(),
                bucket: bucket.clone(),
                key: key.clone(),
            }),
            (Location::Remote { bucket, key }, Location::Local(dest)) => Ok(Transfer::Download {
                bucket: bucket.clone(),
                key: key.clone(),
                dest: dest.clone(),
            }),
            (
                Location::Remote {
                    bucket: src_bucket,
                    key: src_key,
                },
                Location::Remote { bucket, key },
            ) => Ok(Transfer::Copy {
                src_bucket: src_bucket.clone(),
                src_key: src_key.clone(),
                bucket: bucket.clone(),
                key: key.clone(),
            }),
            (Location::Local(_), Location::Local(_)) => Err(anyhow!(
                "transfers between two local paths are not supported"
            )),
        }
    }

    fn source(&self) -> Location {
        match self {
            Transfer::Upload { src, .. } => Location::Local(src.clone()),
            Transfer::Download { bucket, key, .. } => Location::remote(bucket.clone(), key.clone()),
            Transfer::Copy {
                src_bucket,
                src_key,
                ..
            } => Location::remote(src_bucket.clone(), src_key.clone()),
        }
    }

    fn kind(&self) -> OperationKind {
        match self {
            Transfer::Upload { .. } => OperationKind::Upload,
            Transfer::Download { .. } => OperationKind::Download,
            Transfer::Copy { .. } => OperationKind::Copy,
        }
    }
}

/// The work one entry stands for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Task {
    Transfer(Transfer),
    /// transfer, then remove the source
    Move(Transfer),
    Delete(Location),
    MakeBucket(String),
    RemoveBucket(String),
}

fn bucket_of(location: &Location) -> Result<String> {
    location
        .bucket()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} is not a bucket", location))
}

impl Task {
    pub fn from_entry(entry: &Entry) -> Result<Self> {
        match entry.operation {
            OperationKind::Upload | OperationKind::Download | OperationKind::Copy => {
                let transfer = Transfer::between(&entry.src, &entry.dest)?;
                if transfer.kind() != entry.operation {
                    return Err(anyhow!(
                        "cannot {} from {} to {}",
                        entry.operation,
                        entry.src,
                        entry.dest
                    ));
                }
                Ok(Task::Transfer(transfer))
            }
            OperationKind::Move => Ok(Task::Move(Transfer::between(&entry.src, &entry.dest)?)),
            OperationKind::Delete => Ok(Task::Delete(entry.dest.clone())),
            OperationKind::MakeBucket => Ok(Task::MakeBucket(bucket_of(&entry.dest)?)),
            OperationKind::RemoveBucket => Ok(Task::RemoveBucket(bucket_of(&entry.dest)?)),
        }
    }
}

async fn upload(ctx: &TransferContext, src: &Path, bucket: &str, key: &str) -> Result<u64> {
    let size = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", src))?
        .len();
    if ctx.config.use_multipart(size) {
        let source = PartSource::File(src.to_path_buf());
        multipart::upload(ctx, source, bucket, key, size).await?;
        return Ok(size);
    }
    let _permit = ctx.throttle.open_file_permit().await;
    let file = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("failed opening {:?} for reading", src))?;
    ctx.throttle.get_transfer_tokens(size).await;
    ctx.throttle.get_ops_token().await;
    let body = tokio_util::io::ReaderStream::new(file).boxed();
    ctx.store.put(bucket, key, body, size).await?;
    Ok(size)
}

async fn download(
    ctx: &TransferContext,
    bucket: &str,
    key: &str,
    dest: &Path,
    entry: &Entry,
) -> Result<u64> {
    let size = entry.size;
    if ctx.config.use_multipart(size) {
        multipart::download(ctx, bucket, key, dest, size).await?;
    } else {
        ctx.throttle.get_ops_token().await;
        let mut body = ctx.store.get(bucket, key, None).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating directory {:?}", parent))?;
        }
        ctx.throttle.get_transfer_tokens(size).await;
        let _permit = ctx.throttle.open_file_permit().await;
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed creating {:?}", dest))?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.with_context(|| format!("failed reading s3://{bucket}/{key}"))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed writing {:?}", dest))?;
        }
        file.flush().await?;
    }
    // the next sync compares against the object's timestamp, not the download time
    let mtime = filetime::FileTime::from_unix_time(
        entry.last_modified.timestamp(),
        entry.last_modified.timestamp_subsec_nanos(),
    );
    filetime::set_file_mtime(dest, mtime)
        .with_context(|| format!("failed setting modification time of {:?}", dest))?;
    Ok(size)
}

async fn copy(
    ctx: &TransferContext,
    src_bucket: &str,
    src_key: &str,
    bucket: &str,
    key: &str,
    size: u64,
) -> Result<u64> {
    if ctx.config.use_multipart(size) {
        let source = PartSource::Object {
            bucket: src_bucket.to_string(),
            key: src_key.to_string(),
        };
        multipart::upload(ctx, source, bucket, key, size).await?;
        return Ok(size);
    }
    ctx.throttle.get_ops_token().await;
    let body = ctx.store.get(src_bucket, src_key, None).await?;
    ctx.throttle.get_transfer_tokens(size).await;
    ctx.throttle.get_ops_token().await;
    ctx.store.put(bucket, key, body, size).await?;
    Ok(size)
}

async fn transfer(ctx: &TransferContext, transfer: &Transfer, entry: &Entry) -> Result<u64> {
    match transfer {
        Transfer::Upload { src, bucket, key } => upload(ctx, src, bucket, key).await,
        Transfer::Download { bucket, key, dest } => download(ctx, bucket, key, dest, entry).await,
        Transfer::Copy {
            src_bucket,
            src_key,
            bucket,
            key,
        } => copy(ctx, src_bucket, src_key, bucket, key, entry.size).await,
    }
}

async fn delete(ctx: &TransferContext, target: &Location) -> Result<()> {
    match target {
        Location::Local(path) => match tokio::fs::remove_file(path).await {
            Err(error) if error.kind() != std::io::ErrorKind::NotFound => {
                Err(error).with_context(|| format!("failed removing {:?}", path))
            }
            _ => Ok(()),
        },
        Location::Remote { bucket, key } => {
            ctx.throttle.get_ops_token().await;
            match ctx.store.delete(bucket, key).await {
                Ok(()) | Err(StorageError::NotFound(_)) | Err(StorageError::NoSuchBucket(_)) => {
                    Ok(())
                }
                Err(error) => Err(error.into()),
            }
        }
    }
}

/// Executes one entry and returns the number of bytes moved.
///
/// In dry-run mode the task is still resolved, so malformed entries fail the same way, but no
/// storage or filesystem call is made.
#[instrument(skip(ctx, entry), fields(key = %entry.compare_key, operation = %entry.operation))]
pub async fn execute(ctx: &TransferContext, entry: &Entry, dry_run: bool) -> Result<u64> {
    let task = Task::from_entry(entry)?;
    if dry_run {
        return Ok(0);
    }
    match task {
        Task::Transfer(ref t) => transfer(ctx, t, entry).await,
        Task::Move(ref t) => {
            let bytes = transfer(ctx, t, entry).await?;
            delete(ctx, &t.source())
                .await
                .context("transferred, but removing the source failed")?;
            Ok(bytes)
        }
        Task::Delete(ref target) => {
            delete(ctx, target).await?;
            Ok(0)
        }
        Task::MakeBucket(ref bucket) => {
            ctx.throttle.get_ops_token().await;
            match ctx.store.create_container(bucket).await {
                Ok(()) | Err(StorageError::BucketAlreadyOwnedByYou(_)) => Ok(0),
                Err(error) => Err(error.into()),
            }
        }
        Task::RemoveBucket(ref bucket) => {
            ctx.throttle.get_ops_token().await;
            match ctx.store.remove_container(bucket).await {
                Ok(()) | Err(StorageError::NoSuchBucket(_)) => Ok(0),
                Err(error) => Err(error.into()),
            }
        }
    }
}

pub struct Executor {
    ctx: TransferContext,
    dry_run: bool,
}

impl Executor {
    pub fn new(ctx: TransferContext, dry_run: bool) -> Self {
        Self { ctx, dry_run }
    }

    /// Drains `rx` until it closes or the run is cancelled, sending one outcome per entry.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<Entry>,
        status_tx: mpsc::Sender<Outcome>,
    ) -> Result<()> {
        let max_width = self.ctx.config.max_concurrent_requests.max(1);
        let mut join_set = tokio::task::JoinSet::new();
        loop {
            let entry = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    tracing::info!("cancelled, not starting any more entries");
                    break;
                }
                entry = rx.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            while join_set.len() >= max_width {
                if let Some(joined) = join_set.join_next().await {
                    joined.context("worker task failed")?;
                }
            }
            let ctx = self.ctx.clone();
            let status_tx = status_tx.clone();
            let dry_run = self.dry_run;
            join_set.spawn(async move {
                let result = execute(&ctx, &entry, dry_run).await;
                if status_tx
                    .send(Outcome {
                        entry,
                        dry_run,
                        result,
                    })
                    .await
                    .is_err()
                {
                    tracing::error!("status writer stopped before all entries were reported");
                }
            });
        }
        while let Some(joined) = join_set.join_next().await {
            joined.context("worker task failed")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::status::{self, StatusSink, Summary};
    use crate::storage::memory::MemoryStore;
    use crate::testutils;

    fn context(store: Arc<MemoryStore>) -> TransferContext {
        TransferContext::new(
            store,
            TransferConfig {
                max_concurrent_requests: 2,
                multipart_threshold: 4,
                multipart_chunksize: 4,
                retry_delay: std::time::Duration::from_millis(1),
                ..Default::default()
            },
            Arc::new(throttle::Throttle::unlimited()),
            CancellationToken::new(),
        )
    }

    async fn run_entries(
        ctx: TransferContext,
        entries: Vec<Entry>,
        dry_run: bool,
    ) -> Result<(Vec<String>, Summary)> {
        let rx = testutils::send_all(entries).await;
        let (status_tx, status_rx) = mpsc::channel(4);
        let (sink, lines) = StatusSink::buffer();
        let writer = tokio::spawn(status::write_status(status_rx, sink));
        Executor::new(ctx, dry_run).run(rx, status_tx).await?;
        let summary = writer.await?;
        let mut lines = lines.lock().unwrap().clone();
        lines.sort();
        Ok((lines, summary))
    }

    fn upload_entry(dir: &Path, name: &str) -> Entry {
        Entry {
            src: Location::Local(dir.join(name)),
            dest: Location::remote("bucket", name),
            compare_key: name.to_string(),
            size: 0,
            last_modified: testutils::timestamp(0),
            etag: None,
            operation: OperationKind::Upload,
            dir_op: true,
        }
    }

    #[test]
    fn tasks_follow_location_kinds() {
        let entry = testutils::entry("a", 1, 0);
        assert_eq!(
            Task::from_entry(&entry).unwrap(),
            Task::Transfer(Transfer::Download {
                bucket: "bucket".to_string(),
                key: "a".to_string(),
                dest: Path::new("dst").join("a"),
            })
        );
        let mut wrong = entry.clone();
        wrong.operation = OperationKind::Upload;
        assert!(Task::from_entry(&wrong).is_err());
        assert_eq!(
            Task::from_entry(&entry.into_deletion()).unwrap(),
            Task::Delete(Location::remote("bucket", "a"))
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn failures_are_isolated() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        tokio::fs::write(tmp_dir.path().join("1.txt"), "1").await?;
        tokio::fs::write(tmp_dir.path().join("3.txt"), "3").await?;
        let store = Arc::new(MemoryStore::new());
        store.create_bucket("bucket");
        let entries = vec![
            upload_entry(tmp_dir.path(), "1.txt"),
            upload_entry(tmp_dir.path(), "2.txt"),
            upload_entry(tmp_dir.path(), "3.txt"),
        ];
        let (lines, summary) = run_entries(context(store.clone()), entries, false).await?;
        let dir = tmp_dir.path().display();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with(&format!(
            "upload failed: {dir}/2.txt to s3://bucket/2.txt Error: failed reading metadata"
        )));
        assert_eq!(lines[1], format!("upload: {dir}/1.txt to s3://bucket/1.txt"));
        assert_eq!(lines[2], format!("upload: {dir}/3.txt to s3://bucket/3.txt"));
        assert!(summary.has_failures());
        assert_eq!(store.keys("bucket"), ["1.txt", "3.txt"]);
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_makes_no_mutations() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        tokio::fs::write(tmp_dir.path().join("big.bin"), "0123456789").await?;
        let store = Arc::new(MemoryStore::new());
        store.insert_object("bucket", "old", b"x", testutils::timestamp(0));
        let entries = vec![
            upload_entry(tmp_dir.path(), "big.bin"),
            testutils::entry("old", 1, 0).into_deletion(),
            Entry::for_bucket(OperationKind::MakeBucket, "new"),
        ];
        let (lines, summary) = run_entries(context(store.clone()), entries, true).await?;
        assert!(store.mutations().is_empty());
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|line| line.starts_with("(dryrun) ")));
        assert!(!summary.has_failures());
        Ok(())
    }

    #[tokio::test]
    async fn bucket_operations_are_idempotent() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket("mine");
        store.add_foreign_bucket("theirs");
        let entries = vec![
            Entry::for_bucket(OperationKind::MakeBucket, "mine"),
            Entry::for_bucket(OperationKind::MakeBucket, "theirs"),
            Entry::for_bucket(OperationKind::RemoveBucket, "gone"),
            testutils::entry("missing", 1, 0).into_deletion(),
        ];
        let (lines, _) = run_entries(context(store), entries, false).await?;
        assert_eq!(
            lines,
            [
                "delete: s3://bucket/missing".to_string(),
                "make_bucket failed: s3://theirs/ Error: An error occurred (BucketAlreadyExists): The requested bucket name is not available: theirs".to_string(),
                "make_bucket: s3://mine/".to_string(),
                "remove_bucket: s3://gone/".to_string(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn download_sets_modification_time() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("bucket", "a/b.txt", b"hello", testutils::timestamp(1_000_000));
        let tmp_dir = tempfile::tempdir()?;
        let mut entry = testutils::entry("a/b.txt", 5, 1_000_000);
        entry.dest = Location::Local(tmp_dir.path().join("a").join("b.txt"));
        let bytes = execute(&context(store), &entry, false).await?;
        assert_eq!(bytes, 5);
        let metadata = std::fs::metadata(tmp_dir.path().join("a").join("b.txt"))?;
        assert_eq!(
            filetime::FileTime::from_last_modification_time(&metadata).unix_seconds(),
            1_000_000
        );
        Ok(())
    }

    #[tokio::test]
    async fn move_removes_source_after_transfer() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("src", "k", b"0123456789", testutils::timestamp(0));
        store.create_bucket("dst");
        let entry = Entry {
            src: Location::remote("src", "k"),
            dest: Location::remote("dst", "k"),
            compare_key: "k".to_string(),
            size: 10,
            last_modified: testutils::timestamp(0),
            etag: None,
            operation: OperationKind::Move,
            dir_op: false,
        };
        execute(&context(store.clone()), &entry, false).await?;
        assert_eq!(store.object("dst", "k").unwrap(), &b"0123456789"[..]);
        assert!(store.object("src", "k").is_none());
        // a failed transfer keeps the source
        store.insert_object("src", "k", b"0123456789", testutils::timestamp(0));
        store.fail_part(1);
        assert!(execute(&context(store.clone()), &entry, false).await.is_err());
        assert!(store.object("src", "k").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_executor_takes_no_entries() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket("bucket");
        let ctx = context(store.clone());
        ctx.cancel.cancel();
        let (lines, _) =
            run_entries(ctx, vec![testutils::entry("a", 1, 0).into_deletion()], false).await?;
        assert!(lines.is_empty());
        assert!(store.calls().is_empty());
        Ok(())
    }
}
