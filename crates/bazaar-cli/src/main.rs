use anyhow::{bail, Context, Result};
use bazaar_catalog::{Catalog, SlugAllocator};
use bazaar_core::Document;
use bazaar_storage::snapshot::{self, SnapshotRecord};
use bazaar_storage::{InMemoryStore, Storage};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bazaar")]
#[command(about = "Bazaar catalog admin CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Load rows from a JSON file of `{"<entity>": [docs]}` and write a snapshot.
    Seed {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, env = "BAZAAR_DATA_DIR")]
        data_dir: PathBuf,
        /// Empty each seeded collection first.
        #[arg(long)]
        reset: bool,
    },
    /// Print the documents of a snapshot as JSON lines.
    Dump {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        collection: Option<String>,
    },
    /// Print per-collection document counts of a snapshot.
    Stats {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Seed {
            file,
            data_dir,
            reset,
        } => seed(&file, &data_dir, reset).await,
        Cmd::Dump {
            snapshot,
            collection,
        } => dump(&snapshot, collection.as_deref()),
        Cmd::Stats { snapshot } => stats(&snapshot),
    }
}

fn read_seed_file(path: &Path) -> Result<BTreeMap<String, Vec<Document>>> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: BTreeMap<String, Vec<Document>> =
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed)
}

async fn seed(file: &Path, data_dir: &Path, reset: bool) -> Result<()> {
    let rows = read_seed_file(file)?;
    let store = match snapshot::latest_snapshot(data_dir)? {
        Some(path) => snapshot::load_snapshot(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => InMemoryStore::new(),
    };
    let store: Arc<dyn Storage> = Arc::new(store);
    let catalog = Catalog::marketplace(store.clone(), SlugAllocator::default()).await?;

    for (entity, docs) in rows {
        let svc = catalog.service(&entity)?;
        let env = svc
            .insert_many(docs, reset)
            .await
            .with_context(|| format!("seeding {entity}"))?;
        info!(%entity, inserted = env.count.unwrap_or(0), reset, "seeded");
    }
    let manifest = snapshot::write_snapshot(&*store, data_dir)?;
    info!(path = %manifest.path, documents = manifest.documents, "snapshot written");
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

fn records(path: &Path) -> Result<Vec<SnapshotRecord>> {
    if !path.exists() {
        bail!("no snapshot at {}", path.display());
    }
    snapshot::read_snapshot(path).with_context(|| format!("reading {}", path.display()))
}

fn dump(path: &Path, collection: Option<&str>) -> Result<()> {
    let out = std::io::stdout();
    let mut out = out.lock();
    for rec in records(path)? {
        if collection.is_some_and(|c| c != rec.collection) {
            continue;
        }
        let line = match collection {
            Some(_) => serde_json::to_string(&rec.doc)?,
            None => serde_json::to_string(&rec)?,
        };
        writeln!(out, "{line}")?;
    }
    Ok(())
}

fn count_by_collection(recs: &[SnapshotRecord]) -> BTreeMap<&str, u64> {
    let mut counts = BTreeMap::new();
    for rec in recs {
        *counts.entry(rec.collection.as_str()).or_insert(0) += 1;
    }
    counts
}

fn stats(path: &Path) -> Result<()> {
    let recs = records(path)?;
    let counts = count_by_collection(&recs);
    let report = serde_json::json!({
        "snapshot": path.display().to_string(),
        "documents": recs.len(),
        "collections": counts,
        "readOnly": recs
            .iter()
            .filter(|r| r.doc.get("readOnly") == Some(&JsonValue::Bool(true)))
            .count(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_group_by_collection() {
        let rec = |c: &str| SnapshotRecord {
            collection: c.to_string(),
            doc: Document::new(),
        };
        let recs = vec![rec("brands"), rec("categories"), rec("brands")];
        let counts = count_by_collection(&recs);
        assert_eq!(counts.get("brands"), Some(&2));
        assert_eq!(counts.get("categories"), Some(&1));
    }

    #[tokio::test]
    async fn seed_writes_a_loadable_snapshot() {
        let dir = tempfile::tempdir().expect("temp dir");
        let file = dir.path().join("seed.json");
        std::fs::write(
            &file,
            json!({
                "category": [{"name": "Uncategorized", "readOnly": true}, {"name": "Books"}],
                "brand": [{"name": "Acme"}],
            })
            .to_string(),
        )
        .unwrap();
        seed(&file, dir.path(), false).await.unwrap();

        let latest = snapshot::latest_snapshot(dir.path()).unwrap().unwrap();
        let recs = records(&latest).unwrap();
        let counts = count_by_collection(&recs);
        assert_eq!(counts.get("categories"), Some(&2));
        assert_eq!(counts.get("brands"), Some(&1));
    }

    #[tokio::test]
    async fn unknown_entities_abort_seeding() {
        let dir = tempfile::tempdir().expect("temp dir");
        let file = dir.path().join("seed.json");
        std::fs::write(&file, json!({"widgets": [{"name": "x"}]}).to_string()).unwrap();
        assert!(seed(&file, dir.path(), false).await.is_err());
    }
}
