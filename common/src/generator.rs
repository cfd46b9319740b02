//! Ordered entry generation from local trees and remote listings
//!
//! A generator walks one root and sends [`Entry`] values into a bounded channel in strictly
//! increasing `compare_key` order. Keys are compared as raw bytes, which is also the order object
//! stores list keys in. For local trees this means a directory `a` sorts as `a/`, so `a-b` comes
//! before everything below `a`.
//!
//! Remote listings are paged. Each page is sorted on its own, and pages are expected to follow
//! each other in key order, as object stores return them. A page that repeats or precedes a key
//! already emitted fails the listing instead of being merged.
//!
//! Any walk or listing failure ends the generator with an error; the pipeline treats that as
//! fatal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::instrument;

use crate::entry::{ConsumerGone, Entry, OperationKind};
use crate::location::Location;
use crate::multipart;
use crate::storage::{ObjectMeta, ObjectStore, StorageError};

#[derive(Clone, Debug)]
pub struct GeneratorSettings {
    pub root: Location,
    /// where generated entries go, `None` makes every entry point back at its own source
    pub dest: Option<Location>,
    pub operation: OperationKind,
    pub dir_op: bool,
    /// emit zero-byte `dir/` objects
    pub include_markers: bool,
    pub follow_symlinks: bool,
    /// a missing local root yields no entries instead of failing
    pub missing_root_ok: bool,
}

pub struct Generator {
    settings: GeneratorSettings,
    store: Arc<dyn ObjectStore>,
    throttle: Arc<throttle::Throttle>,
}

fn system_time(time: std::io::Result<std::time::SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Resolves the destination of a single item; a directory-like destination receives the source
/// file name.
pub async fn single_item_destination(src: &Location, dest: &Location) -> Location {
    let use_source_name = match dest {
        Location::Remote { .. } => dest.is_dir_like(),
        Location::Local(path) => {
            dest.is_dir_like()
                || tokio::fs::metadata(path)
                    .await
                    .is_ok_and(|metadata| metadata.is_dir())
        }
    };
    match (use_source_name, src.file_name()) {
        (true, Some(name)) => dest.as_root().join(&name),
        _ => dest.clone(),
    }
}

impl Generator {
    pub fn new(
        settings: GeneratorSettings,
        store: Arc<dyn ObjectStore>,
        throttle: Arc<throttle::Throttle>,
    ) -> Self {
        Self {
            settings,
            store,
            throttle,
        }
    }

    fn entry(
        &self,
        src: Location,
        dest: Location,
        compare_key: String,
        size: u64,
        last_modified: DateTime<Utc>,
        etag: Option<String>,
    ) -> Entry {
        Entry {
            src,
            dest,
            compare_key,
            size,
            last_modified,
            etag,
            operation: self.settings.operation,
            dir_op: self.settings.dir_op,
        }
    }

    fn tree_entry(
        &self,
        src: Location,
        compare_key: String,
        size: u64,
        last_modified: DateTime<Utc>,
        etag: Option<String>,
    ) -> Entry {
        let dest = match &self.settings.dest {
            Some(dest) => dest.as_root().join(&compare_key),
            None => src.clone(),
        };
        self.entry(src, dest, compare_key, size, last_modified, etag)
    }

    /// Sends all entries under the root into `tx`.
    #[instrument(skip(self, tx), fields(root = %self.settings.root))]
    pub async fn run(self, tx: &mpsc::Sender<Entry>) -> Result<()> {
        if !self.settings.dir_op {
            return self.single_item(tx).await;
        }
        match self.settings.root.clone() {
            Location::Local(path) => self.local_tree(&path, tx).await,
            Location::Remote { bucket, key } => self.remote_tree(&bucket, &key, tx).await,
        }
    }

    async fn emit(tx: &mpsc::Sender<Entry>, entry: Entry) -> Result<()> {
        tracing::trace!("generated: {}", entry.compare_key);
        tx.send(entry)
            .await
            .map_err(|_| ConsumerGone("entry consumer").into())
    }

    async fn single_item(&self, tx: &mpsc::Sender<Entry>) -> Result<()> {
        let src = self.settings.root.clone();
        let compare_key = src.file_name().unwrap_or_default();
        let dest = match &self.settings.dest {
            Some(dest) => single_item_destination(&src, dest).await,
            None => src.clone(),
        };
        let (size, last_modified, etag) = match &src {
            Location::Local(path) => match tokio::fs::metadata(path).await {
                Ok(metadata) => (
                    metadata.len(),
                    system_time(metadata.modified()),
                    None,
                ),
                Err(error) => {
                    tracing::debug!("no metadata for {:?}: {}", path, error);
                    (0, DateTime::<Utc>::UNIX_EPOCH, None)
                }
            },
            Location::Remote { bucket, key } => {
                self.throttle.get_ops_token().await;
                match self.store.head(bucket, key).await {
                    Ok(meta) => (meta.size, meta.last_modified, meta.etag),
                    Err(error) => {
                        // the executor reports the failure against this entry
                        tracing::debug!("no metadata for {}: {}", src, error);
                        (0, DateTime::<Utc>::UNIX_EPOCH, None)
                    }
                }
            }
        };
        let entry = self.entry(src, dest, compare_key, size, last_modified, etag);
        Self::emit(tx, entry).await
    }

    async fn local_tree(&self, root: &Path, tx: &mpsc::Sender<Entry>) -> Result<()> {
        let metadata = match tokio::fs::metadata(root).await {
            Ok(metadata) => metadata,
            Err(error)
                if error.kind() == std::io::ErrorKind::NotFound && self.settings.missing_root_ok =>
            {
                tracing::debug!("{:?} does not exist yet, nothing to list", root);
                return Ok(());
            }
            Err(error) => {
                return Err(anyhow::Error::from(error).context(format!(
                    "The user-provided path {} does not exist.",
                    root.display()
                )));
            }
        };
        if !metadata.is_dir() {
            return Err(anyhow!("{} is not a directory", root.display()));
        }
        let canonical = tokio::fs::canonicalize(root)
            .await
            .with_context(|| format!("failed resolving {:?}", root))?;
        let mut ancestors = vec![canonical];
        self.walk_local(root, "", &mut ancestors, tx).await
    }

    #[async_recursion]
    async fn walk_local(
        &self,
        dir: &Path,
        relative: &str,
        ancestors: &mut Vec<PathBuf>,
        tx: &mpsc::Sender<Entry>,
    ) -> Result<()> {
        let mut read_dir = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
        let mut children = vec![];
        while let Some(child) = read_dir
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", dir))?
        {
            let path = child.path();
            let name = child
                .file_name()
                .into_string()
                .map_err(|name| anyhow!("file name {:?} in {:?} is not valid UTF-8", name, dir))?;
            if name.ends_with(multipart::TEMP_SUFFIX) {
                tracing::debug!("skipping partial download {:?}", path);
                continue;
            }
            let file_type = child
                .file_type()
                .await
                .with_context(|| format!("failed reading file type of {:?}", path))?;
            let metadata = if file_type.is_symlink() {
                if !self.settings.follow_symlinks {
                    tracing::debug!("skipping symlink {:?}", path);
                    continue;
                }
                match tokio::fs::metadata(&path).await {
                    Ok(metadata) => metadata,
                    Err(error) => {
                        tracing::warn!("skipping file with bad symlink: {:?}: {}", path, error);
                        continue;
                    }
                }
            } else {
                child
                    .metadata()
                    .await
                    .with_context(|| format!("failed reading metadata from {:?}", path))?
            };
            let sort_name = if metadata.is_dir() {
                format!("{name}/")
            } else {
                name
            };
            children.push((sort_name, path, metadata, file_type.is_symlink()));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        for (sort_name, path, metadata, is_symlink) in children {
            let compare_key = format!("{relative}{sort_name}");
            if metadata.is_dir() {
                let canonical = if is_symlink {
                    tokio::fs::canonicalize(&path)
                        .await
                        .with_context(|| format!("failed resolving {:?}", path))?
                } else {
                    ancestors
                        .last()
                        .map(|parent| parent.join(sort_name.trim_end_matches('/')))
                        .unwrap_or_else(|| path.clone())
                };
                if ancestors.contains(&canonical) {
                    tracing::warn!("skipping symlink loop at {:?}", path);
                    continue;
                }
                ancestors.push(canonical);
                self.walk_local(&path, &compare_key, ancestors, tx).await?;
                ancestors.pop();
            } else if metadata.is_file() {
                let entry = self.tree_entry(
                    Location::Local(path),
                    compare_key,
                    metadata.len(),
                    system_time(metadata.modified()),
                    None,
                );
                Self::emit(tx, entry).await?;
            } else {
                tracing::debug!("skipping special file {:?}", path);
            }
        }
        Ok(())
    }

    async fn remote_tree(&self, bucket: &str, key: &str, tx: &mpsc::Sender<Entry>) -> Result<()> {
        let prefix = match self.settings.root.as_root() {
            Location::Remote { key, .. } => key,
            Location::Local(_) => key.to_string(),
        };
        let mut continuation: Option<String> = None;
        let mut last_key: Option<String> = None;
        loop {
            self.throttle.get_ops_token().await;
            let page = self
                .store
                .list_page(bucket, &prefix, continuation.as_deref())
                .await
                .map_err(|error| match error {
                    StorageError::NoSuchBucket(_) => anyhow::Error::from(error),
                    error => anyhow::Error::from(error)
                        .context(format!("failed listing s3://{bucket}/{prefix}")),
                })?;
            let mut objects = page.objects;
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            for meta in objects {
                if let Some(last) = &last_key {
                    if meta.key <= *last {
                        return Err(anyhow!(
                            "listing of s3://{}/{} went backwards: {:?} after {:?}",
                            bucket,
                            prefix,
                            meta.key,
                            last
                        ));
                    }
                }
                last_key = Some(meta.key.clone());
                if let Some(entry) = self.remote_entry(bucket, &prefix, meta)? {
                    Self::emit(tx, entry).await?;
                }
            }
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(())
    }

    fn remote_entry(&self, bucket: &str, prefix: &str, meta: ObjectMeta) -> Result<Option<Entry>> {
        let compare_key = meta
            .key
            .strip_prefix(prefix)
            .ok_or_else(|| {
                anyhow!(
                    "listing returned {:?} outside of prefix {:?}",
                    meta.key,
                    prefix
                )
            })?
            .to_string();
        let is_marker = meta.size == 0 && meta.key.ends_with('/');
        if is_marker && !self.settings.include_markers {
            return Ok(None);
        }
        Ok(Some(self.tree_entry(
            Location::remote(bucket, meta.key),
            compare_key,
            meta.size,
            meta.last_modified,
            meta.etag,
        )))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tracing_test::traced_test;

    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::testutils;

    fn settings(
        root: Location,
        dest: Option<Location>,
        operation: OperationKind,
    ) -> GeneratorSettings {
        GeneratorSettings {
            root,
            dest,
            operation,
            dir_op: true,
            include_markers: false,
            follow_symlinks: true,
            missing_root_ok: false,
        }
    }

    async fn generate(
        settings: GeneratorSettings,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Vec<Entry>> {
        let (tx, rx) = mpsc::channel(16);
        let generator = Generator::new(settings, store, Arc::new(throttle::Throttle::unlimited()));
        let collect = tokio::spawn(testutils::drain(rx));
        let result = generator.run(&tx).await;
        drop(tx);
        let entries = collect.await?;
        result.map(|()| entries)
    }

    fn keys(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.compare_key.as_str()).collect()
    }

    #[tokio::test]
    #[traced_test]
    async fn local_walk_is_byte_ordered() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let root = Location::Local(tmp_dir.path().join("foo"));
        let entries = generate(
            settings(root, Some(Location::remote("bucket", "pre")), OperationKind::Upload),
            Arc::new(MemoryStore::new()),
        )
        .await?;
        assert_eq!(
            keys(&entries),
            [
                "0.txt",
                "bar-baz.txt",
                "bar/1.txt",
                "bar/2.txt",
                "bar/3.txt",
                "baz/4.txt",
                "baz/5.txt",
                "empty.txt"
            ]
        );
        let empty = entries.last().unwrap();
        assert_eq!(empty.size, 0);
        assert_eq!(empty.dest, Location::remote("bucket", "pre/empty.txt"));
        // symlinks are followed to the file they point at
        assert_eq!(entries[6].size, 2);
        Ok(())
    }

    #[tokio::test]
    async fn partial_downloads_are_not_listed() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        tokio::fs::write(tmp_dir.path().join("a.txt"), "a").await?;
        tokio::fs::write(
            tmp_dir.path().join(format!(".a.txt.1{}", multipart::TEMP_SUFFIX)),
            "",
        )
        .await?;
        let root = Location::Local(tmp_dir.path().to_path_buf());
        let entries = generate(
            settings(root, None, OperationKind::Upload),
            Arc::new(MemoryStore::new()),
        )
        .await?;
        assert_eq!(keys(&entries), ["a.txt"]);
        Ok(())
    }

    #[tokio::test]
    async fn local_walk_can_skip_symlinks() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let mut settings = settings(
            Location::Local(tmp_dir.path().join("foo")),
            None,
            OperationKind::Upload,
        );
        settings.follow_symlinks = false;
        let entries = generate(settings, Arc::new(MemoryStore::new())).await?;
        assert!(!keys(&entries).contains(&"baz/5.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_local_root() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let root = Location::Local(tmp_dir.path().join("nope"));
        let mut settings = settings(root, None, OperationKind::Download);
        let error = generate(settings.clone(), Arc::new(MemoryStore::new()))
            .await
            .unwrap_err();
        assert!(format!("{:#}", error).contains("does not exist"));
        settings.missing_root_ok = true;
        assert!(generate(settings, Arc::new(MemoryStore::new())).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn listing_that_goes_backwards_fails() -> Result<()> {
        let store = MemoryStore::with_page_size(2).with_overlapping_pages();
        for key in ["a", "b", "c"] {
            store.insert_object("bucket", key, b"", testutils::timestamp(0));
        }
        let error = generate(
            settings(Location::remote("bucket", ""), None, OperationKind::Delete),
            Arc::new(store),
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", error).contains("went backwards: \"b\" after \"b\""));
        Ok(())
    }

    #[tokio::test]
    async fn remote_pages_are_merged_in_order() -> Result<()> {
        let store = MemoryStore::with_page_size(2).with_reversed_pages();
        for key in ["p/c", "p/a", "p/b/x", "p/b-1", "p/d/", "q"] {
            store.insert_object("bucket", key, b"", testutils::timestamp(0));
        }
        let store = Arc::new(store);
        let entries = generate(
            settings(
                Location::remote("bucket", "p"),
                Some(Location::Local("out".into())),
                OperationKind::Download,
            ),
            store.clone(),
        )
        .await?;
        assert_eq!(keys(&entries), ["a", "b-1", "b/x", "c"]);
        assert_eq!(
            entries[2].dest,
            Location::Local(Path::new("out").join("b").join("x"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn markers_only_for_deletes() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("bucket", "dir/", b"", testutils::timestamp(0));
        store.insert_object("bucket", "dir/a", b"1", testutils::timestamp(0));
        let mut settings = settings(Location::remote("bucket", ""), None, OperationKind::Delete);
        assert_eq!(keys(&generate(settings.clone(), store.clone()).await?), ["dir/a"]);
        settings.include_markers = true;
        assert_eq!(keys(&generate(settings, store).await?), ["dir/", "dir/a"]);
        Ok(())
    }

    #[tokio::test]
    async fn listing_failure_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket("bucket");
        store.fail_listing();
        let settings = settings(Location::remote("bucket", ""), None, OperationKind::Delete);
        assert!(generate(settings, store).await.is_err());
        let settings = settings_for_missing_bucket();
        let error = generate(settings, Arc::new(MemoryStore::new())).await.unwrap_err();
        assert!(error.to_string().contains("NoSuchBucket"));
    }

    fn settings_for_missing_bucket() -> GeneratorSettings {
        settings(Location::remote("missing", ""), None, OperationKind::Delete)
    }

    #[tokio::test]
    async fn single_item_always_yields_one_entry() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("bucket", "dir/file.txt", b"abc", testutils::timestamp(7));
        let mut single = settings(
            Location::remote("bucket", "dir/file.txt"),
            Some(Location::remote("other", "")),
            OperationKind::Copy,
        );
        single.dir_op = false;
        let entries = generate(single.clone(), store.clone()).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[0].dest, Location::remote("other", "file.txt"));
        single.root = Location::remote("bucket", "missing.txt");
        single.dest = Some(Location::remote("other", "renamed.txt"));
        let entries = generate(single, store).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[0].dest, Location::remote("other", "renamed.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn single_item_into_existing_directory() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dest = Location::Local(tmp_dir.path().to_path_buf());
        let resolved = single_item_destination(&Location::remote("b", "x/y.bin"), &dest).await;
        assert_eq!(resolved, Location::Local(tmp_dir.path().join("y.bin")));
        Ok(())
    }

    fn tree_strategy() -> impl Strategy<Value = std::collections::BTreeSet<String>> {
        let segment = "[ab.0-]{1,3}";
        proptest::collection::btree_set(proptest::collection::vec(segment, 1..4), 1..20).prop_map(
            |paths| {
                // a path that is a file must not also be a directory
                let mut files = std::collections::BTreeSet::new();
                for segments in paths {
                    if segments.iter().any(|s| s == "." || s == "..") {
                        continue;
                    }
                    files.insert(segments.join("/"));
                }
                let all = files.clone();
                files
                    .into_iter()
                    .filter(|file| {
                        let dir = format!("{file}/");
                        !all.iter().any(|other| other.starts_with(&dir))
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn local_walk_keys_are_strictly_increasing(files in tree_strategy()) {
            let tmp_dir = tempfile::tempdir().unwrap();
            for file in &files {
                let path = tmp_dir.path().join(file);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, b"x").unwrap();
            }
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let root = Location::Local(tmp_dir.path().to_path_buf());
            let entries = runtime
                .block_on(generate(
                    settings(root, None, OperationKind::Upload),
                    Arc::new(MemoryStore::new()),
                ))
                .unwrap();
            let generated: Vec<String> = entries.into_iter().map(|e| e.compare_key).collect();
            prop_assert!(generated.windows(2).all(|w| w[0] < w[1]));
            let expected: Vec<String> = files.into_iter().collect();
            prop_assert_eq!(generated, expected);
        }
    }
}
