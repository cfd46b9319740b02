use chrono::{DateTime, Utc};

use crate::entry::{Entry, OperationKind};
use crate::location::Location;

pub fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
}

pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- bar-baz.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    // |- empty.txt (zero bytes)
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "22").await?;
    tokio::fs::write(bar_path.join("3.txt"), "333").await?;
    tokio::fs::write(foo_path.join("bar-baz.txt"), "-").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4444").await?;
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt")).await?;
    tokio::fs::write(foo_path.join("empty.txt"), "").await?;
    Ok(tmp_dir)
}

/// A download entry from `s3://bucket/<key>` to `dst/<key>`.
pub fn entry(key: &str, size: u64, secs: i64) -> Entry {
    Entry {
        src: Location::remote("bucket", key),
        dest: Location::Local(std::path::Path::new("dst").join(key)),
        compare_key: key.to_string(),
        size,
        last_modified: timestamp(secs),
        etag: None,
        operation: OperationKind::Download,
        dir_op: true,
    }
}

pub async fn send_all(entries: Vec<Entry>) -> tokio::sync::mpsc::Receiver<Entry> {
    let (tx, rx) = tokio::sync::mpsc::channel(entries.len().max(1));
    for entry in entries {
        tx.send(entry).await.unwrap();
    }
    rx
}

pub async fn drain<T>(mut rx: tokio::sync::mpsc::Receiver<T>) -> Vec<T> {
    let mut items = vec![];
    while let Some(item) = rx.recv().await {
        items.push(item);
    }
    items
}
