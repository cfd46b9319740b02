//! The object storage capability consumed by the transfer engine
//!
//! The engine never talks to a network client directly. Everything it needs from a store is
//! expressed by [`ObjectStore`]: paged listing, metadata lookup, ranged reads, single-shot writes,
//! the four multipart calls, deletes and bucket management.
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryStore`] keeps objects in memory, records every call and can inject faults
//! - [`fs::FsStore`] maps buckets and keys onto a local directory

pub mod fs;
pub mod memory;

use chrono::{DateTime, Utc};
use futures::StreamExt;

/// Streaming object payload.
pub type ByteStream = futures::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("An error occurred (404) when calling the HeadObject operation: Not Found: {0}")]
    NotFound(String),
    #[error("An error occurred (NoSuchBucket): The specified bucket does not exist: {0}")]
    NoSuchBucket(String),
    #[error("An error occurred (BucketAlreadyOwnedByYou): {0}")]
    BucketAlreadyOwnedByYou(String),
    #[error(
        "An error occurred (BucketAlreadyExists): The requested bucket name is not available: {0}"
    )]
    BucketAlreadyExists(String),
    #[error("An error occurred (BucketNotEmpty): The bucket you tried to delete is not empty: {0}")]
    BucketNotEmpty(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    /// full object key
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: Option<String>,
}

/// One page of a listing, keys are not guaranteed to be sorted within the page.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    /// pass back to `list_page` to get the next page, `None` on the last page
    pub continuation: Option<String>,
}

/// Half-open byte range `[start, start + len)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists objects whose keys start with `prefix`.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, StorageError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StorageError>;

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, StorageError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size: u64,
    ) -> Result<(), StorageError>;

    /// Starts a multipart upload and returns its id.
    async fn multipart_init(&self, bucket: &str, key: &str) -> Result<String, StorageError>;

    /// Uploads one part (numbered from 1) and returns its etag.
    async fn multipart_upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: bytes::Bytes,
    ) -> Result<String, StorageError>;

    async fn multipart_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError>;

    async fn multipart_abort(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    async fn create_container(&self, bucket: &str) -> Result<(), StorageError>;

    async fn remove_container(&self, bucket: &str) -> Result<(), StorageError>;
}

/// Reads a whole stream into memory, used for multipart parts which are bounded by the part size.
pub async fn collect(mut stream: ByteStream) -> std::io::Result<bytes::Bytes> {
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Wraps an in-memory payload into a [`ByteStream`].
#[must_use]
pub fn once(body: bytes::Bytes) -> ByteStream {
    futures::stream::once(async move { Ok(body) }).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_concatenates_chunks() {
        let stream = futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"ab")),
            Ok(bytes::Bytes::from_static(b"cd")),
        ])
        .boxed();
        assert_eq!(collect(stream).await.unwrap(), bytes::Bytes::from_static(b"abcd"));
    }

    #[test]
    fn errors_render_on_one_line() {
        let error = StorageError::NoSuchBucket("missing".to_string());
        assert!(!error.to_string().contains('\n'));
        assert!(error.to_string().contains("NoSuchBucket"));
    }
}
