use crate::metrics;
use anyhow::bail;
use bazaar_core::StateError;
use bazaar_storage::snapshot::{self, SnapshotManifest};
use bazaar_storage::{InMemoryStore, Storage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const SNAPSHOTS_KEPT: usize = 5;

/// Restores the newest readable snapshot. Unreadable snapshots are skipped
/// with a warning; if none of several existing snapshots loads, startup fails
/// rather than serving an empty catalog.
pub fn open_store(data_dir: Option<&Path>) -> anyhow::Result<InMemoryStore> {
    let Some(dir) = data_dir else {
        info!("no data dir configured, running memory only");
        return Ok(InMemoryStore::new());
    };
    let candidates = snapshot::list_snapshots(dir)?;
    if candidates.is_empty() {
        info!(dir = %dir.display(), "no snapshot found, starting empty");
        return Ok(InMemoryStore::new());
    }
    for path in &candidates {
        match snapshot::load_snapshot(path) {
            Ok(store) => {
                info!(
                    path = %path.display(),
                    collections = store.collection_names().len(),
                    "snapshot loaded"
                );
                return Ok(store);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "snapshot unreadable, trying an older one"),
        }
    }
    bail!("none of {} snapshots in {} could be read", candidates.len(), dir.display())
}

pub async fn snapshot_now(
    store: Arc<dyn Storage>,
    data_dir: PathBuf,
) -> Result<SnapshotManifest, StateError> {
    let started = Instant::now();
    let res = tokio::task::spawn_blocking(move || {
        let manifest = snapshot::write_snapshot(&*store, &data_dir)?;
        let pruned = snapshot::prune_snapshots(&data_dir, SNAPSHOTS_KEPT)?;
        if pruned > 0 {
            info!(pruned, "old snapshots removed");
        }
        Ok::<_, std::io::Error>(manifest)
    })
    .await
    .map_err(|e| StateError::Storage(format!("snapshot task: {e}")))
    .and_then(|r| r.map_err(|e| StateError::Storage(format!("snapshot: {e}"))));
    metrics::record_snapshot(started, res.is_ok());
    res
}

pub fn spawn_snapshotter(
    store: Arc<dyn Storage>,
    data_dir: PathBuf,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = snapshot_now(store.clone(), data_dir.clone()).await {
                error!(error = %e, "periodic snapshot failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn snapshot_then_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(InMemoryStore::new());
        let serde_json::Value::Object(doc) = json!({"name": "Books", "slug": "books"}) else {
            unreachable!()
        };
        store.insert_one("categories", doc).await.unwrap();

        let manifest = snapshot_now(store.clone(), dir.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(manifest.documents, 1);

        let reopened = open_store(Some(dir.path())).unwrap();
        assert_eq!(reopened.all_documents("categories"), store.all_documents("categories"));
    }

    #[test]
    fn unreadable_snapshots_fail_startup() {
        let dir = tempfile::tempdir().expect("temp dir");
        let snaps = snapshot::snapshot_dir(dir.path());
        std::fs::create_dir_all(&snaps).unwrap();
        std::fs::write(snaps.join("snap-1.zst"), b"not zstd").unwrap();
        assert!(open_store(Some(dir.path())).is_err());
    }

    #[test]
    fn memory_only_without_data_dir() {
        let store = open_store(None).unwrap();
        assert!(store.collection_names().is_empty());
    }
}
