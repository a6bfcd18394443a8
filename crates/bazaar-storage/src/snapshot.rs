use crate::{InMemoryStore, Storage};
use bazaar_core::Document;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub created_ts: i64,
    pub collections: usize,
    pub documents: usize,
    pub path: String,
}

/// One line of a snapshot file.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub collection: String,
    pub doc: Document,
}

pub struct SnapshotWriter {
    out: zstd::Encoder<'static, File>,
    tmp: PathBuf,
    pub path: PathBuf,
    documents: usize,
}

impl SnapshotWriter {
    pub fn create(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("zst.tmp");
        let out = zstd::Encoder::new(File::create(&tmp)?, 3)?;
        Ok(Self {
            out,
            tmp,
            path,
            documents: 0,
        })
    }

    pub fn write_record(&mut self, rec: &SnapshotRecord) -> std::io::Result<()> {
        let s = serde_json::to_string(rec)?;
        self.out.write_all(s.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.documents += 1;
        Ok(())
    }

    /// Flushes and moves the file into place; readers never see a partial snapshot.
    pub fn finish(self) -> std::io::Result<usize> {
        self.out.finish()?.sync_all()?;
        std::fs::rename(&self.tmp, &self.path)?;
        Ok(self.documents)
    }
}

pub fn snapshot_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOT_DIR)
}

/// Writes every collection of `store` to a new snapshot under `data_dir`.
pub fn write_snapshot(store: &dyn Storage, data_dir: &Path) -> std::io::Result<SnapshotManifest> {
    let created = Utc::now();
    let path = snapshot_dir(data_dir).join(format!("snap-{}.zst", created.timestamp_millis()));
    let mut w = SnapshotWriter::create(path.clone())?;
    let names = store.collection_names();
    for name in &names {
        for doc in store.all_documents(name) {
            w.write_record(&SnapshotRecord {
                collection: name.clone(),
                doc,
            })?;
        }
    }
    let documents = w.finish()?;
    tracing::info!(path = %path.display(), documents, "snapshot written");
    Ok(SnapshotManifest {
        created_ts: created.timestamp(),
        collections: names.len(),
        documents,
        path: path.to_string_lossy().to_string(),
    })
}

pub fn read_snapshot(path: &Path) -> std::io::Result<Vec<SnapshotRecord>> {
    let d = zstd::Decoder::new(File::open(path)?)?;
    let mut out = Vec::new();
    for line in BufReader::new(d).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

/// Snapshot files under `data_dir`, newest first. Names embed their
/// creation time.
pub fn list_snapshots(data_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let dir = snapshot_dir(data_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found: Vec<(i64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let stamp = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("snap-"))
            .and_then(|n| n.strip_suffix(".zst"))
            .and_then(|n| n.parse::<i64>().ok());
        if let Some(stamp) = stamp {
            found.push((stamp, path));
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

pub fn latest_snapshot(data_dir: &Path) -> std::io::Result<Option<PathBuf>> {
    Ok(list_snapshots(data_dir)?.into_iter().next())
}

/// Removes all but the `keep` newest snapshots; returns how many went.
pub fn prune_snapshots(data_dir: &Path, keep: usize) -> std::io::Result<usize> {
    let stale = list_snapshots(data_dir)?.into_iter().skip(keep.max(1));
    let mut removed = 0;
    for path in stale {
        std::fs::remove_file(&path)?;
        tracing::debug!(path = %path.display(), "snapshot pruned");
        removed += 1;
    }
    Ok(removed)
}

pub fn load_snapshot(path: &Path) -> std::io::Result<InMemoryStore> {
    let store = InMemoryStore::new();
    let mut grouped: Vec<(String, Vec<Document>)> = Vec::new();
    for rec in read_snapshot(path)? {
        match grouped.iter_mut().find(|(c, _)| *c == rec.collection) {
            Some((_, docs)) => docs.push(rec.doc),
            None => grouped.push((rec.collection, vec![rec.doc])),
        }
    }
    for (collection, docs) in grouped {
        store.restore(&collection, docs);
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_collections() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = InMemoryStore::new();
        store
            .insert_many(
                "categories",
                vec![doc(json!({"name": "Books"})), doc(json!({"name": "Music"}))],
            )
            .await
            .unwrap();
        store
            .insert_one("brands", doc(json!({"name": "Acme"})))
            .await
            .unwrap();

        let manifest = write_snapshot(&store, dir.path()).unwrap();
        assert_eq!(manifest.documents, 3);
        assert_eq!(manifest.collections, 2);

        let latest = latest_snapshot(dir.path()).unwrap().expect("a snapshot");
        let restored = load_snapshot(&latest).unwrap();
        assert_eq!(restored.collection_names(), vec!["brands", "categories"]);
        assert_eq!(
            restored.all_documents("categories"),
            store.all_documents("categories")
        );
    }

    #[test]
    fn prune_keeps_the_newest() {
        let dir = tempfile::tempdir().expect("temp dir");
        let snaps = snapshot_dir(dir.path());
        std::fs::create_dir_all(&snaps).unwrap();
        for stamp in [100, 300, 200, 400] {
            std::fs::write(snaps.join(format!("snap-{stamp}.zst")), b"").unwrap();
        }
        std::fs::write(snaps.join("notes.txt"), b"").unwrap();
        assert_eq!(prune_snapshots(dir.path(), 2).unwrap(), 2);
        let left = list_snapshots(dir.path()).unwrap();
        assert_eq!(left, vec![snaps.join("snap-400.zst"), snaps.join("snap-300.zst")]);
        assert!(snaps.join("notes.txt").exists());
    }

    #[test]
    fn latest_snapshot_is_none_for_empty_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(latest_snapshot(dir.path()).unwrap().is_none());
    }
}
