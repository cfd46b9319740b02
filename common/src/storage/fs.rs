//! Directory-backed object store
//!
//! `s3://bucket/key` lives at `<root>/<bucket>/<key>`. Empty directories are listed as zero-byte
//! `dir/` markers. Multipart parts are staged under `<root>/.multipart/<upload-id>/` and
//! concatenated into the final object on completion.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{
    ByteRange, ByteStream, CompletedPart, ListPage, ObjectMeta, ObjectStore, StorageError,
};

const STAGING_DIR: &str = ".multipart";

#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    page_size: usize,
    next_upload_id: AtomicU64,
}

fn not_found_as(error: std::io::Error, not_found: StorageError) -> StorageError {
    if error.kind() == std::io::ErrorKind::NotFound {
        not_found
    } else {
        StorageError::Io(error)
    }
}

fn validate_bucket(bucket: &str) -> Result<(), StorageError> {
    if bucket.is_empty() || bucket.starts_with('.') || bucket.contains(['/', '\\']) {
        return Err(StorageError::Other(format!(
            "InvalidBucketName: {bucket:?} is not a valid bucket name"
        )));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.split('/').any(|segment| segment == ".." || segment == ".") {
        return Err(StorageError::Other(format!(
            "InvalidKey: {key:?} contains relative path segments"
        )));
    }
    Ok(())
}

fn modified(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: 1000,
            next_upload_id: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        validate_bucket(bucket)?;
        Ok(self.root.join(bucket))
    }

    async fn existing_bucket(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        let path = self.bucket_path(bucket)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => Ok(path),
            Ok(_) => Err(StorageError::NoSuchBucket(bucket.to_string())),
            Err(error) => Err(not_found_as(
                error,
                StorageError::NoSuchBucket(bucket.to_string()),
            )),
        }
    }

    async fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        let mut path = self.existing_bucket(bucket).await?;
        for segment in key.split('/').filter(|segment| !segment.is_empty()) {
            path.push(segment);
        }
        Ok(path)
    }

    fn staging_path(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(StorageError::Other(format!("NoSuchUpload: {upload_id}")));
        }
        Ok(self.root.join(STAGING_DIR).join(upload_id))
    }

    /// Every key in the bucket, sorted, with empty directories as markers.
    fn scan_bucket(bucket_path: &Path, prefix: &str) -> anyhow::Result<Vec<ObjectMeta>> {
        let mut objects = vec![];
        for entry in walkdir::WalkDir::new(bucket_path).min_depth(1) {
            let entry =
                entry.with_context(|| format!("failed walking bucket {:?}", bucket_path))?;
            let relative = entry
                .path()
                .strip_prefix(bucket_path)
                .with_context(|| format!("{:?} escaped bucket {:?}", entry.path(), bucket_path))?;
            let mut key = relative
                .to_str()
                .with_context(|| format!("non UTF-8 object path {:?}", entry.path()))?
                .replace(std::path::MAIN_SEPARATOR, "/");
            let metadata = entry
                .metadata()
                .with_context(|| format!("failed reading metadata of {:?}", entry.path()))?;
            if metadata.is_dir() {
                let is_empty = std::fs::read_dir(entry.path())
                    .with_context(|| format!("failed reading directory {:?}", entry.path()))?
                    .next()
                    .is_none();
                if !is_empty {
                    continue;
                }
                key.push('/');
            }
            if !key.starts_with(prefix) {
                continue;
            }
            objects.push(ObjectMeta {
                key,
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                last_modified: modified(&metadata),
                etag: None,
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    /// Removes directories left empty by a delete, up to the bucket root.
    async fn prune_empty_parents(bucket_path: &Path, mut path: &Path) {
        while let Some(parent) = path.parent() {
            if parent == bucket_path || !parent.starts_with(bucket_path) {
                break;
            }
            if tokio::fs::remove_dir(parent).await.is_err() {
                break;
            }
            path = parent;
        }
    }

    async fn write_stream(path: &Path, mut body: ByteStream) -> Result<u64, StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        let bucket_path = self.existing_bucket(bucket).await?;
        let scan_prefix = prefix.to_string();
        let objects = tokio::task::spawn_blocking(move || {
            FsStore::scan_bucket(&bucket_path, &scan_prefix)
        })
        .await
        .map_err(|error| StorageError::Other(format!("listing task failed: {error}")))?
        .map_err(|error| StorageError::Other(format!("{error:#}")))?;
        let mut remaining = objects
            .into_iter()
            .filter(|meta| continuation.is_none_or(|token| meta.key.as_str() > token));
        let page: Vec<ObjectMeta> = remaining.by_ref().take(self.page_size).collect();
        let continuation = match remaining.next() {
            Some(_) => page.last().map(|meta| meta.key.clone()),
            None => None,
        };
        Ok(ListPage {
            objects: page,
            continuation,
        })
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StorageError> {
        let path = self.object_path(bucket, key).await?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|error| not_found_as(error, StorageError::NotFound(key.to_string())))?;
        if metadata.is_dir() != key.ends_with('/') {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(ObjectMeta {
            key: key.to_string(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            last_modified: modified(&metadata),
            etag: None,
        })
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, StorageError> {
        let path = self.object_path(bucket, key).await?;
        if key.ends_with('/') {
            tokio::fs::metadata(&path)
                .await
                .map_err(|error| not_found_as(error, StorageError::NotFound(key.to_string())))?;
            return Ok(futures::stream::empty().boxed());
        }
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|error| not_found_as(error, StorageError::NotFound(key.to_string())))?;
        match range {
            None => Ok(tokio_util::io::ReaderStream::new(file).boxed()),
            Some(ByteRange { start, len }) => {
                file.seek(std::io::SeekFrom::Start(start)).await?;
                Ok(tokio_util::io::ReaderStream::new(file.take(len)).boxed())
            }
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size: u64,
    ) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key).await?;
        if key.ends_with('/') {
            tokio::fs::create_dir_all(&path).await?;
            return Ok(());
        }
        let written = Self::write_stream(&path, body).await?;
        if written != size {
            return Err(StorageError::Other(format!(
                "IncompleteBody: expected {size} bytes, got {written}"
            )));
        }
        Ok(())
    }

    async fn multipart_init(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        self.object_path(bucket, key).await?;
        let upload_id = format!(
            "{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            self.next_upload_id.fetch_add(1, Ordering::Relaxed)
        );
        tokio::fs::create_dir_all(self.staging_path(&upload_id)?).await?;
        Ok(upload_id)
    }

    async fn multipart_upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: bytes::Bytes,
    ) -> Result<String, StorageError> {
        let staging = self.staging_path(upload_id)?;
        if tokio::fs::metadata(&staging).await.is_err() {
            return Err(StorageError::Other(format!("NoSuchUpload: {upload_id}")));
        }
        let len = body.len();
        tokio::fs::write(staging.join(format!("part-{part_number:05}")), body).await?;
        Ok(format!("\"{part_number}-{len}\""))
    }

    async fn multipart_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let staging = self.staging_path(upload_id)?;
        let path = self.object_path(bucket, key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(&path).await?;
        for part in &parts {
            let part_path = staging.join(format!("part-{:05}", part.part_number));
            let mut part_file = tokio::fs::File::open(&part_path).await.map_err(|error| {
                not_found_as(
                    error,
                    StorageError::Other(format!(
                        "InvalidPart: part {} of {upload_id}",
                        part.part_number
                    )),
                )
            })?;
            tokio::io::copy(&mut part_file, &mut out).await?;
        }
        out.flush().await?;
        tokio::fs::remove_dir_all(&staging).await?;
        Ok(())
    }

    async fn multipart_abort(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        tokio::fs::remove_dir_all(self.staging_path(upload_id)?)
            .await
            .map_err(|error| {
                not_found_as(error, StorageError::Other(format!("NoSuchUpload: {upload_id}")))
            })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let bucket_path = self.existing_bucket(bucket).await?;
        let path = self.object_path(bucket, key).await?;
        let removed = if key.ends_with('/') {
            tokio::fs::remove_dir(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|error| not_found_as(error, StorageError::NotFound(key.to_string())))?;
        Self::prune_empty_parents(&bucket_path, &path).await;
        Ok(())
    }

    async fn create_container(&self, bucket: &str) -> Result<(), StorageError> {
        let path = self.bucket_path(bucket)?;
        tokio::fs::create_dir_all(&self.root).await?;
        match tokio::fs::create_dir(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::BucketAlreadyOwnedByYou(bucket.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn remove_container(&self, bucket: &str) -> Result<(), StorageError> {
        let path = self.existing_bucket(bucket).await?;
        let mut entries = tokio::fs::read_dir(&path).await?;
        if entries.next_entry().await?.is_some() {
            return Err(StorageError::BucketNotEmpty(bucket.to_string()));
        }
        tokio::fs::remove_dir(&path).await?;
        Ok(())
    }
}
