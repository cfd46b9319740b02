use chrono::{DateTime, Utc};
use enum_map::Enum;

use crate::location::Location;

/// The transfer verb an [`Entry`] executes under.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum)]
pub enum OperationKind {
    Upload,
    Download,
    Copy,
    Move,
    Delete,
    MakeBucket,
    RemoveBucket,
}

impl OperationKind {
    /// Verb used in status lines, these tokens are parsed by scripts and must not change.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Copy => "copy",
            OperationKind::Move => "move",
            OperationKind::Delete => "delete",
            OperationKind::MakeBucket => "make_bucket",
            OperationKind::RemoveBucket => "remove_bucket",
        }
    }

    /// Whether the status line names a destination next to the source.
    #[must_use]
    pub fn has_destination(&self) -> bool {
        matches!(
            self,
            OperationKind::Upload
                | OperationKind::Download
                | OperationKind::Copy
                | OperationKind::Move
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.verb())
    }
}

/// One file or object participating in a transfer.
///
/// Generators emit entries in strictly increasing `compare_key` order; the comparator relies on
/// that to merge two sides without buffering them.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub src: Location,
    pub dest: Location,
    /// path relative to the operation root, `/` separated
    pub compare_key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// checksum-equivalent metadata reported by the store, if any
    pub etag: Option<String>,
    pub operation: OperationKind,
    pub dir_op: bool,
}

impl Entry {
    /// Zero-byte `dir/` objects stand in for empty prefixes.
    #[must_use]
    pub fn is_directory_marker(&self) -> bool {
        self.size == 0 && self.compare_key.ends_with('/')
    }

    /// A synthetic entry for bucket level operations.
    #[must_use]
    pub fn for_bucket(operation: OperationKind, bucket: &str) -> Self {
        let location = Location::remote(bucket, "");
        Self {
            src: location.clone(),
            dest: location,
            compare_key: String::new(),
            size: 0,
            last_modified: DateTime::<Utc>::UNIX_EPOCH,
            etag: None,
            operation,
            dir_op: true,
        }
    }

    /// Turns an entry found on the destination side into a deletion of that object/file.
    #[must_use]
    pub fn into_deletion(self) -> Self {
        Self {
            dest: self.src.clone(),
            operation: OperationKind::Delete,
            ..self
        }
    }
}

/// The stage reading a producer's entries went away before the producer finished.
///
/// Only ever a consequence of a failure elsewhere in the pipeline.
#[derive(Debug, thiserror::Error)]
#[error("{0} stopped accepting entries")]
pub struct ConsumerGone(pub &'static str);
