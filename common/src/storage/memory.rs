//! In-memory object store with a call log and fault injection

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ByteRange, ByteStream, CompletedPart, ListPage, ObjectMeta, ObjectStore, StorageError,
};

/// One capability call as observed by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    List { bucket: String, prefix: String },
    Head { bucket: String, key: String },
    Get { bucket: String, key: String, range: Option<ByteRange> },
    Put { bucket: String, key: String, size: u64 },
    MultipartInit { bucket: String, key: String },
    UploadPart { upload_id: String, part_number: u32 },
    MultipartComplete { upload_id: String },
    MultipartAbort { upload_id: String },
    Delete { bucket: String, key: String },
    CreateContainer { bucket: String },
    RemoveContainer { bucket: String },
}

impl Call {
    /// True for every call that changes the state of the store.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Call::List { .. } | Call::Head { .. } | Call::Get { .. })
    }
}

#[derive(Clone, Debug)]
struct StoredObject {
    data: bytes::Bytes,
    last_modified: DateTime<Utc>,
    etag: String,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, bytes::Bytes)>,
}

#[derive(Debug, Default)]
struct Faults {
    parts: HashSet<u32>,
    keys: HashSet<String>,
    list: bool,
    foreign_buckets: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
    calls: Vec<Call>,
    faults: Faults,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: std::sync::Mutex<Inner>,
    page_size: usize,
    reverse_pages: bool,
    overlap_pages: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn etag_of(data: &[u8]) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::hash::DefaultHasher::new();
    data.hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

fn injected(what: &str) -> StorageError {
    StorageError::Other(format!("injected failure: {what}"))
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            inner: std::sync::Mutex::new(Inner::default()),
            page_size: page_size.max(1),
            reverse_pages: false,
            overlap_pages: false,
        }
    }

    /// Returns the objects of every page in descending key order.
    #[must_use]
    pub fn with_reversed_pages(mut self) -> Self {
        self.reverse_pages = true;
        self
    }

    /// Continues every listing after the first key of a page, so pages repeat keys.
    #[must_use]
    pub fn with_overlapping_pages(mut self) -> Self {
        self.overlap_pages = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a panic while holding the lock only happens in a failing test
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.lock().buckets.entry(bucket.to_string()).or_default();
    }

    pub fn insert_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        last_modified: DateTime<Utc>,
    ) {
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    data: bytes::Bytes::copy_from_slice(data),
                    last_modified,
                    etag: etag_of(data),
                },
            );
    }

    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<bytes::Bytes> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.data.clone())
    }

    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.lock().buckets.contains_key(bucket)
    }

    #[must_use]
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    #[must_use]
    pub fn mutations(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    /// Every upload of the given part number fails.
    pub fn fail_part(&self, part_number: u32) {
        self.lock().faults.parts.insert(part_number);
    }

    /// Every read or write of the given key fails.
    pub fn fail_key(&self, key: &str) {
        self.lock().faults.keys.insert(key.to_string());
    }

    pub fn fail_listing(&self) {
        self.lock().faults.list = true;
    }

    /// The bucket name exists but belongs to someone else.
    pub fn add_foreign_bucket(&self, bucket: &str) {
        self.lock().faults.foreign_buckets.insert(bucket.to_string());
    }

    fn record(&self, call: Call) -> std::sync::MutexGuard<'_, Inner> {
        let mut inner = self.lock();
        inner.calls.push(call);
        inner
    }
}

fn bucket_mut<'a>(
    inner: &'a mut Inner,
    bucket: &str,
) -> Result<&'a mut BTreeMap<String, StoredObject>, StorageError> {
    inner
        .buckets
        .get_mut(bucket)
        .ok_or_else(|| StorageError::NoSuchBucket(bucket.to_string()))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        let mut inner = self.record(Call::List {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        });
        if inner.faults.list {
            return Err(injected("list"));
        }
        let objects = bucket_mut(&mut inner, bucket)?;
        let start = match continuation {
            Some(token) => std::ops::Bound::Excluded(token.to_string()),
            None => std::ops::Bound::Included(prefix.to_string()),
        };
        let mut matching = objects
            .range((start, std::ops::Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix));
        let mut page: Vec<ObjectMeta> = matching
            .by_ref()
            .take(self.page_size)
            .map(|(key, object)| ObjectMeta {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
                etag: Some(object.etag.clone()),
            })
            .collect();
        let continuation = match matching.next() {
            Some(_) if self.overlap_pages => page.first().map(|meta| meta.key.clone()),
            Some(_) => page.last().map(|meta| meta.key.clone()),
            None => None,
        };
        if self.reverse_pages {
            page.reverse();
        }
        Ok(ListPage {
            objects: page,
            continuation,
        })
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StorageError> {
        let mut inner = self.record(Call::Head {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        if inner.faults.keys.contains(key) {
            return Err(injected(key));
        }
        let object = bucket_mut(&mut inner, bucket)?
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: object.data.len() as u64,
            last_modified: object.last_modified,
            etag: Some(object.etag.clone()),
        })
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, StorageError> {
        let mut inner = self.record(Call::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
            range,
        });
        if inner.faults.keys.contains(key) {
            return Err(injected(key));
        }
        let data = bucket_mut(&mut inner, bucket)?
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?
            .data
            .clone();
        let data = match range {
            None => data,
            Some(ByteRange { start, len }) => {
                let start = usize::try_from(start).unwrap_or(usize::MAX);
                if start > data.len() {
                    return Err(StorageError::Other(format!(
                        "InvalidRange: {start} is past the end of {key}"
                    )));
                }
                let end = start
                    .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
                    .min(data.len());
                data.slice(start..end)
            }
        };
        Ok(super::once(data))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size: u64,
    ) -> Result<(), StorageError> {
        {
            let inner = self.record(Call::Put {
                bucket: bucket.to_string(),
                key: key.to_string(),
                size,
            });
            if inner.faults.keys.contains(key) {
                return Err(injected(key));
            }
            if !inner.buckets.contains_key(bucket) {
                return Err(StorageError::NoSuchBucket(bucket.to_string()));
            }
        }
        let data = super::collect(body).await?;
        if data.len() as u64 != size {
            return Err(StorageError::Other(format!(
                "IncompleteBody: expected {size} bytes, got {}",
                data.len()
            )));
        }
        let mut inner = self.lock();
        bucket_mut(&mut inner, bucket)?.insert(
            key.to_string(),
            StoredObject {
                etag: etag_of(&data),
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn multipart_init(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        let mut inner = self.record(Call::MultipartInit {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        if inner.faults.keys.contains(key) {
            return Err(injected(key));
        }
        bucket_mut(&mut inner, bucket)?;
        inner.next_upload_id += 1;
        let upload_id = format!("upload-{}", inner.next_upload_id);
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
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
        let mut inner = self.record(Call::UploadPart {
            upload_id: upload_id.to_string(),
            part_number,
        });
        if inner.faults.parts.contains(&part_number) {
            return Err(injected(&format!("part {part_number}")));
        }
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::Other(format!("NoSuchUpload: {upload_id}")))?;
        let etag = etag_of(&body);
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn multipart_complete(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let mut inner = self.record(Call::MultipartComplete {
            upload_id: upload_id.to_string(),
        });
        let upload = inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StorageError::Other(format!("NoSuchUpload: {upload_id}")))?;
        let mut data = bytes::BytesMut::new();
        for part in &parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, body)) if *etag == part.etag => data.extend_from_slice(body),
                _ => {
                    return Err(StorageError::Other(format!(
                        "InvalidPart: part {} of {upload_id}",
                        part.part_number
                    )));
                }
            }
        }
        let data = data.freeze();
        bucket_mut(&mut inner, &upload.bucket)?.insert(
            upload.key,
            StoredObject {
                etag: format!("{}-{}\"", etag_of(&data).trim_end_matches('"'), parts.len()),
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn multipart_abort(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.record(Call::MultipartAbort {
            upload_id: upload_id.to_string(),
        });
        inner
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::Other(format!("NoSuchUpload: {upload_id}")))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut inner = self.record(Call::Delete {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        if inner.faults.keys.contains(key) {
            return Err(injected(key));
        }
        bucket_mut(&mut inner, bucket)?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn create_container(&self, bucket: &str) -> Result<(), StorageError> {
        let mut inner = self.record(Call::CreateContainer {
            bucket: bucket.to_string(),
        });
        if inner.faults.foreign_buckets.contains(bucket) {
            return Err(StorageError::BucketAlreadyExists(bucket.to_string()));
        }
        if inner.buckets.contains_key(bucket) {
            return Err(StorageError::BucketAlreadyOwnedByYou(bucket.to_string()));
        }
        inner.buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn remove_container(&self, bucket: &str) -> Result<(), StorageError> {
        let mut inner = self.record(Call::RemoveContainer {
            bucket: bucket.to_string(),
        });
        match inner.buckets.get(bucket) {
            None => Err(StorageError::NoSuchBucket(bucket.to_string())),
            Some(objects) if !objects.is_empty() => {
                Err(StorageError::BucketNotEmpty(bucket.to_string()))
            }
            Some(_) => {
                inner.buckets.remove(bucket);
                Ok(())
            }
        }
    }
}
