use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use enum_map::{Enum, EnumMap};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::entry::{ConsumerGone, Entry};
use crate::location::LocationKind;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum Decision {
    /// both sides hold the same content
    Same,
    /// source is missing at, or differs from, the destination
    Transfer,
    /// destination-only entry, removed when deleting orphans
    Delete,
    /// destination-only entry, kept
    Skip,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct CompareSettings {
    /// remove destination entries missing from the source
    pub delete: bool,
    /// only sizes decide whether an entry changed
    pub size_only: bool,
    /// how much newer the source must be before it counts as changed
    pub clock_skew: std::time::Duration,
}

pub type CompareSummary = EnumMap<Decision, u64>;

fn is_remote(entry: &Entry) -> bool {
    entry.src.kind() == LocationKind::Remote
}

fn truncate_to_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}

fn source_is_newer(src: &Entry, dst: &Entry, settings: &CompareSettings) -> bool {
    let (src_time, dst_time) = if is_remote(src) || is_remote(dst) {
        (
            truncate_to_seconds(src.last_modified),
            truncate_to_seconds(dst.last_modified),
        )
    } else {
        (src.last_modified, dst.last_modified)
    };
    let skew = TimeDelta::from_std(settings.clock_skew).unwrap_or(TimeDelta::MAX);
    src_time - dst_time > skew
}

/// Decides whether a source entry must be transferred over an existing destination entry.
#[must_use]
pub fn decide(src: &Entry, dst: &Entry, settings: &CompareSettings) -> Decision {
    if src.size != dst.size {
        return Decision::Transfer;
    }
    if settings.size_only {
        return Decision::Same;
    }
    if is_remote(src) && is_remote(dst) {
        if let (Some(src_etag), Some(dst_etag)) = (&src.etag, &dst.etag) {
            if src_etag == dst_etag {
                return Decision::Same;
            }
        }
    }
    if source_is_newer(src, dst, settings) {
        Decision::Transfer
    } else {
        Decision::Same
    }
}

/// One side of the merge: a channel plus a single entry of lookahead.
struct Cursor<'a> {
    side: &'static str,
    rx: mpsc::Receiver<Entry>,
    head: Option<Entry>,
    last_key: Option<String>,
    cancel: &'a CancellationToken,
}

impl<'a> Cursor<'a> {
    fn new(side: &'static str, rx: mpsc::Receiver<Entry>, cancel: &'a CancellationToken) -> Self {
        Self {
            side,
            rx,
            head: None,
            last_key: None,
            cancel,
        }
    }

    async fn peek(&mut self) -> Result<Option<&Entry>> {
        if self.head.is_none() {
            let Some(entry) = self.rx.recv().await else {
                // a producer that failed cancels the run before closing its channel, so a
                // truncated listing is never taken for a complete one
                if self.cancel.is_cancelled() {
                    return Err(anyhow!("{} listing was interrupted", self.side));
                }
                return Ok(None);
            };
            if let Some(last) = &self.last_key {
                if entry.compare_key <= *last {
                    return Err(anyhow!(
                        "{} entries out of order: {:?} after {:?}",
                        self.side,
                        entry.compare_key,
                        last
                    ));
                }
            }
            self.last_key = Some(entry.compare_key.clone());
            self.head = Some(entry);
        }
        Ok(self.head.as_ref())
    }

    fn advance(&mut self) -> Option<Entry> {
        self.head.take()
    }
}

/// Merges two ordered entry streams and sends the entries that need work to `tx`.
///
/// Transfers carry the source entry, deletions the destination entry turned into a deletion.
/// Either input closing after `cancel` fired is an error, never the end of that side.
#[instrument(skip_all)]
pub async fn compare(
    src_rx: mpsc::Receiver<Entry>,
    dst_rx: mpsc::Receiver<Entry>,
    tx: &mpsc::Sender<Entry>,
    settings: CompareSettings,
    cancel: &CancellationToken,
) -> Result<CompareSummary> {
    let mut src = Cursor::new("source", src_rx, cancel);
    let mut dst = Cursor::new("destination", dst_rx, cancel);
    let mut summary = CompareSummary::default();
    loop {
        let order = match (src.peek().await?, dst.peek().await?) {
            (None, None) => break,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(s), Some(d)) => s.compare_key.cmp(&d.compare_key),
        };
        let (decision, output) = match order {
            std::cmp::Ordering::Less => {
                let Some(entry) = src.advance() else { break };
                if entry.is_directory_marker() {
                    continue;
                }
                (Decision::Transfer, Some(entry))
            }
            std::cmp::Ordering::Greater => {
                let Some(entry) = dst.advance() else { break };
                if settings.delete {
                    (Decision::Delete, Some(entry.into_deletion()))
                } else {
                    (Decision::Skip, None)
                }
            }
            std::cmp::Ordering::Equal => {
                let (Some(s), Some(d)) = (src.advance(), dst.advance()) else {
                    break;
                };
                if s.is_directory_marker() {
                    continue;
                }
                match decide(&s, &d, &settings) {
                    Decision::Transfer => (Decision::Transfer, Some(s)),
                    decision => (decision, None),
                }
            }
        };
        summary[decision] += 1;
        if let Some(entry) = output {
            tracing::debug!("{:?}: {}", decision, entry.compare_key);
            tx.send(entry)
                .await
                .map_err(|_| ConsumerGone("executor"))?;
        }
    }
    tracing::info!(
        "compared: same={} transfer={} delete={} skip={}",
        summary[Decision::Same],
        summary[Decision::Transfer],
        summary[Decision::Delete],
        summary[Decision::Skip]
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::entry::OperationKind;
    use crate::location::Location;
    use crate::testutils::{self, entry};

    async fn run(
        src: Vec<Entry>,
        dst: Vec<Entry>,
        settings: CompareSettings,
    ) -> Result<(Vec<Entry>, CompareSummary)> {
        let src_rx = testutils::send_all(src).await;
        let dst_rx = testutils::send_all(dst).await;
        let (tx, rx) = mpsc::channel(16);
        let drain = tokio::spawn(testutils::drain(rx));
        let summary = compare(src_rx, dst_rx, &tx, settings, &CancellationToken::new()).await;
        drop(tx);
        let out = drain.await?;
        summary.map(|summary| (out, summary))
    }

    fn decisions(out: &[Entry]) -> Vec<(&str, OperationKind)> {
        out.iter()
            .map(|e| (e.compare_key.as_str(), e.operation))
            .collect()
    }

    #[tokio::test]
    #[traced_test]
    async fn merge_join_classifies_each_key() -> Result<()> {
        let src = vec![entry("a", 1, 0), entry("b", 2, 0)];
        let dst = vec![entry("a", 1, 0), entry("c", 2, 0)];
        let (out, summary) = run(
            src.clone(),
            dst.clone(),
            CompareSettings {
                delete: true,
                ..Default::default()
            },
        )
        .await?;
        assert_eq!(
            decisions(&out),
            [("b", OperationKind::Download), ("c", OperationKind::Delete)]
        );
        assert_eq!(summary[Decision::Same], 1);
        let (out, summary) = run(src, dst, CompareSettings::default()).await?;
        assert_eq!(decisions(&out), [("b", OperationKind::Download)]);
        assert_eq!(summary[Decision::Skip], 1);
        Ok(())
    }

    #[tokio::test]
    async fn deletion_targets_destination_side() -> Result<()> {
        let mut orphan = entry("c", 2, 0);
        orphan.src = Location::remote("other", "c");
        let (out, _) = run(
            vec![],
            vec![orphan],
            CompareSettings {
                delete: true,
                ..Default::default()
            },
        )
        .await?;
        assert_eq!(out[0].dest, Location::remote("other", "c"));
        Ok(())
    }

    #[test]
    fn timestamps_decide_when_sizes_match() {
        let settings = CompareSettings::default();
        assert_eq!(
            decide(&entry("x", 10, 100), &entry("x", 10, 50), &settings),
            Decision::Transfer
        );
        assert_eq!(
            decide(&entry("x", 10, 50), &entry("x", 10, 100), &settings),
            Decision::Same
        );
        assert_eq!(
            decide(&entry("x", 10, 50), &entry("x", 11, 100), &settings),
            Decision::Transfer
        );
        let size_only = CompareSettings {
            size_only: true,
            ..Default::default()
        };
        assert_eq!(
            decide(&entry("x", 10, 100), &entry("x", 10, 50), &size_only),
            Decision::Same
        );
    }

    #[test]
    fn sub_second_differences_are_ignored_for_remote() {
        let mut src = entry("x", 1, 100);
        src.last_modified += TimeDelta::milliseconds(900);
        let dst = entry("x", 1, 100);
        assert_eq!(
            decide(&src, &dst, &CompareSettings::default()),
            Decision::Same
        );
    }

    #[test]
    fn clock_skew_is_tolerated() {
        let settings = CompareSettings {
            clock_skew: std::time::Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(
            decide(&entry("x", 1, 104), &entry("x", 1, 100), &settings),
            Decision::Same
        );
        assert_eq!(
            decide(&entry("x", 1, 106), &entry("x", 1, 100), &settings),
            Decision::Transfer
        );
    }

    #[test]
    fn matching_etags_between_remotes() {
        let mut src = entry("x", 1, 200);
        src.dest = Location::remote("dst", "x");
        src.etag = Some("\"abc\"".to_string());
        let mut dst = entry("x", 1, 100);
        dst.etag = Some("\"abc\"".to_string());
        assert_eq!(
            decide(&src, &dst, &CompareSettings::default()),
            Decision::Same
        );
        dst.etag = Some("\"def\"".to_string());
        assert_eq!(
            decide(&src, &dst, &CompareSettings::default()),
            Decision::Transfer
        );
    }

    #[tokio::test]
    async fn markers_only_matter_for_deletes() -> Result<()> {
        let src = vec![entry("d/", 0, 0)];
        let dst = vec![entry("e/", 0, 0)];
        let (out, _) = run(src.clone(), dst.clone(), CompareSettings::default()).await?;
        assert!(out.is_empty());
        let (out, _) = run(
            src,
            dst,
            CompareSettings {
                delete: true,
                ..Default::default()
            },
        )
        .await?;
        assert_eq!(decisions(&out), [("e/", OperationKind::Delete)]);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_keys_are_fatal() {
        let src = vec![entry("a", 1, 0), entry("a", 1, 0)];
        let error = run(src, vec![], CompareSettings::default())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("out of order"));
        let dst = vec![entry("b", 1, 0), entry("a", 1, 0)];
        assert!(run(vec![], dst, CompareSettings::default()).await.is_err());
    }

    #[tokio::test]
    async fn interrupted_listing_never_deletes() -> Result<()> {
        let cancel = CancellationToken::new();
        let (src_tx, src_rx) = mpsc::channel(4);
        src_tx.send(entry("a", 1, 0)).await?;
        cancel.cancel();
        drop(src_tx);
        let dst_rx = testutils::send_all(vec![entry("a", 1, 0), entry("b", 1, 0)]).await;
        let (tx, rx) = mpsc::channel(16);
        let settings = CompareSettings {
            delete: true,
            ..Default::default()
        };
        let error = compare(src_rx, dst_rx, &tx, settings, &cancel)
            .await
            .unwrap_err();
        drop(tx);
        assert!(error.to_string().contains("interrupted"));
        assert!(testutils::drain(rx).await.is_empty());
        Ok(())
    }
}
