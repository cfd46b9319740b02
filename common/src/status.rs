//! Status lines and the single writer that prints them
//!
//! Workers never print. Each finished entry is sent as an [`Outcome`] to [`write_status`], which
//! renders one line per entry and keeps the [`Summary`]. A line is written in one call, so output
//! from different entries never interleaves.

use std::sync::Arc;

use enum_map::{Enum, EnumMap};
use tokio::sync::mpsc;

use crate::entry::{Entry, OperationKind};
use crate::location::Location;

pub const DRY_RUN_PREFIX: &str = "(dryrun) ";

/// Result of executing one entry.
#[derive(Debug)]
pub struct Outcome {
    pub entry: Entry,
    pub dry_run: bool,
    /// bytes moved on success
    pub result: anyhow::Result<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusLine {
    pub operation: OperationKind,
    pub src: Location,
    pub dest: Location,
    pub dry_run: bool,
    pub error: Option<String>,
}

/// Folds a (possibly multi-line) error chain into a single line.
#[must_use]
pub fn one_line(error: &anyhow::Error) -> String {
    format!("{:#}", error)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

impl StatusLine {
    #[must_use]
    pub fn from_outcome(outcome: &Outcome) -> Self {
        Self {
            operation: outcome.entry.operation,
            src: outcome.entry.src.clone(),
            dest: outcome.entry.dest.clone(),
            dry_run: outcome.dry_run,
            error: outcome.result.as_ref().err().map(one_line),
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

impl std::fmt::Display for StatusLine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.dry_run {
            write!(f, "{DRY_RUN_PREFIX}")?;
        }
        write!(f, "{}", self.operation.verb())?;
        if self.error.is_some() {
            write!(f, " failed")?;
        }
        if self.operation.has_destination() {
            write!(f, ": {} to {}", self.src, self.dest)?;
        } else {
            write!(f, ": {}", self.dest)?;
        }
        if let Some(error) = &self.error {
            write!(f, " Error: {}", error)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum Status {
    Succeeded,
    Failed,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub counts: EnumMap<OperationKind, EnumMap<Status, u64>>,
    pub bytes_transferred: u64,
}

impl Summary {
    pub fn record(&mut self, outcome: &Outcome) {
        match &outcome.result {
            Ok(bytes) => {
                self.counts[outcome.entry.operation][Status::Succeeded] += 1;
                self.bytes_transferred += bytes;
            }
            Err(_) => self.counts[outcome.entry.operation][Status::Failed] += 1,
        }
    }

    #[must_use]
    pub fn total(&self, status: Status) -> u64 {
        self.counts.values().map(|counts| counts[status]).sum()
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.total(Status::Failed) > 0
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (operation, &status_map) in &self.counts {
            if status_map.values().all(|&count| count == 0) {
                continue;
            }
            writeln!(
                f,
                "{}: {} succeeded, {} failed",
                operation.verb(),
                status_map[Status::Succeeded],
                status_map[Status::Failed]
            )?;
        }
        write!(
            f,
            "bytes transferred: {}",
            bytesize::ByteSize(self.bytes_transferred)
        )
    }
}

/// Where status lines go.
#[derive(Clone, Debug)]
pub enum StatusSink {
    /// successes on stdout, failures on stderr; `quiet` suppresses both
    Stdio { quiet: bool },
    /// keeps every line in memory
    Buffer(Arc<std::sync::Mutex<Vec<String>>>),
}

impl StatusSink {
    #[must_use]
    pub fn buffer() -> (Self, Arc<std::sync::Mutex<Vec<String>>>) {
        let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
        (StatusSink::Buffer(lines.clone()), lines)
    }

    fn write(&self, line: &StatusLine) {
        match self {
            StatusSink::Stdio { quiet: true } => {}
            StatusSink::Stdio { quiet: false } => {
                if line.is_failure() {
                    eprintln!("{line}");
                } else {
                    println!("{line}");
                }
            }
            StatusSink::Buffer(lines) => lines
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(line.to_string()),
        }
    }
}

/// Prints one line per outcome until every sender is gone.
pub async fn write_status(mut rx: mpsc::Receiver<Outcome>, sink: StatusSink) -> Summary {
    let mut summary = Summary::default();
    while let Some(outcome) = rx.recv().await {
        let line = StatusLine::from_outcome(&outcome);
        if let Err(error) = &outcome.result {
            tracing::debug!("{} failed: {:#}", outcome.entry.compare_key, error);
        }
        sink.write(&line);
        summary.record(&outcome);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::entry;

    fn outcome(entry: Entry, dry_run: bool, result: anyhow::Result<u64>) -> Outcome {
        Outcome {
            entry,
            dry_run,
            result,
        }
    }

    #[test]
    fn transfer_lines() {
        let mut upload = entry("a.txt", 1, 0);
        upload.src = Location::Local("dir/a.txt".into());
        upload.dest = Location::remote("bucket", "pre/a.txt");
        upload.operation = OperationKind::Upload;
        let line = StatusLine::from_outcome(&outcome(upload.clone(), false, Ok(1)));
        assert_eq!(line.to_string(), "upload: dir/a.txt to s3://bucket/pre/a.txt");
        let line = StatusLine::from_outcome(&outcome(upload.clone(), true, Ok(0)));
        assert_eq!(
            line.to_string(),
            "(dryrun) upload: dir/a.txt to s3://bucket/pre/a.txt"
        );
        let error = anyhow::anyhow!("connection reset\nby peer").context("failed reading part 2");
        let line = StatusLine::from_outcome(&outcome(upload, false, Err(error)));
        assert_eq!(
            line.to_string(),
            "upload failed: dir/a.txt to s3://bucket/pre/a.txt Error: failed reading part 2: connection reset by peer"
        );
    }

    #[test]
    fn single_target_lines() {
        let deletion = entry("old.txt", 1, 0).into_deletion();
        let line = StatusLine::from_outcome(&outcome(deletion, false, Ok(0)));
        assert_eq!(line.to_string(), "delete: s3://bucket/old.txt");
        let bucket = Entry::for_bucket(OperationKind::MakeBucket, "fresh");
        let line = StatusLine::from_outcome(&outcome(bucket, false, Ok(0)));
        assert_eq!(line.to_string(), "make_bucket: s3://fresh/");
        let bucket = Entry::for_bucket(OperationKind::RemoveBucket, "full");
        let line = StatusLine::from_outcome(&outcome(
            bucket,
            false,
            Err(anyhow::anyhow!("BucketNotEmpty")),
        ));
        assert_eq!(
            line.to_string(),
            "remove_bucket failed: s3://full/ Error: BucketNotEmpty"
        );
    }

    #[tokio::test]
    async fn writer_counts_outcomes() {
        let (tx, rx) = mpsc::channel(4);
        let (sink, lines) = StatusSink::buffer();
        let writer = tokio::spawn(write_status(rx, sink));
        tx.send(outcome(entry("a", 3, 0), false, Ok(3))).await.unwrap();
        tx.send(outcome(entry("b", 1, 0), false, Err(anyhow::anyhow!("boom"))))
            .await
            .unwrap();
        drop(tx);
        let summary = writer.await.unwrap();
        assert_eq!(summary.total(Status::Succeeded), 1);
        assert_eq!(summary.total(Status::Failed), 1);
        assert_eq!(summary.bytes_transferred, 3);
        assert!(summary.has_failures());
        assert_eq!(lines.lock().unwrap().len(), 2);
        let rendered = summary.to_string();
        assert!(rendered.contains("download: 1 succeeded, 1 failed"));
    }
}
