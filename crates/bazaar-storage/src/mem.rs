use crate::traits::{FindOptions, Storage, Update, UpdateResult};
use bazaar_core::{
    lookup, now_timestamp, set_path, values_equal, Document, FacetPage, Filter, ObjectId,
    Pipeline, Projection, Result, Stage, StateError, COUNT_FIELD, CREATED_AT_FIELD, DATA_FIELD,
    ID_FIELD, METADATA_FIELD, TOTAL_FIELD, UPDATED_AT_FIELD,
};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus::{register_histogram_vec, HistogramVec};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

static AGGREGATE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "bazaar_aggregate_seconds",
        "Aggregation latency",
        &["collection"]
    )
    .expect("bazaar_aggregate_seconds registers once")
});

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Collection>,
}

#[derive(Default)]
struct Collection {
    // insertion order is the natural order of an unsorted scan
    docs: Vec<Document>,
    unique: Vec<String>,
}

impl Collection {
    /// Fails if `doc` would share a unique value with any stored document
    /// outside `skip`, or with one of `pending`.
    fn check_unique(
        &self,
        name: &str,
        doc: &Document,
        skip: &[usize],
        pending: &[Document],
    ) -> Result<()> {
        let stored = self
            .docs
            .iter()
            .enumerate()
            .filter(|(i, _)| !skip.contains(i))
            .map(|(_, d)| d);
        unique_clash(name, doc, &self.unique, stored)?;
        unique_clash(name, doc, &self.unique, pending.iter())
    }
}

fn unique_clash<'a>(
    name: &str,
    doc: &Document,
    unique: &[String],
    others: impl Iterator<Item = &'a Document> + Clone,
) -> Result<()> {
    let fields = std::iter::once(ID_FIELD).chain(unique.iter().map(String::as_str));
    for field in fields {
        let Some(value) = lookup(doc, field).into_iter().next().filter(|v| !v.is_null()) else {
            continue;
        };
        let taken = others.clone().any(|other| {
            lookup(other, field)
                .into_iter()
                .next()
                .is_some_and(|v| values_equal(v, value))
        });
        if taken {
            return Err(StateError::UniqueViolation {
                collection: name.to_string(),
                field: field.to_string(),
                value: match value {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                },
            });
        }
    }
    Ok(())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads documents verbatim, without stamping or constraint checks.
    pub fn restore(&self, collection: &str, docs: Vec<Document>) {
        let mut inner = self.inner.write();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .docs
            .extend(docs);
    }

    fn prepare(mut doc: Document) -> Result<Document> {
        match doc.get(ID_FIELD) {
            None | Some(JsonValue::Null) => {
                doc.insert(ID_FIELD.to_string(), ObjectId::new().to_value());
            }
            Some(v) => {
                let coerced = ObjectId::coerce(v);
                if ObjectId::from_value(&coerced).is_none() {
                    return Err(StateError::Invalid(format!("bad {ID_FIELD}: {v}")));
                }
                doc.insert(ID_FIELD.to_string(), coerced);
            }
        }
        let now = now_timestamp();
        doc.entry(CREATED_AT_FIELD.to_string())
            .or_insert_with(|| now.clone());
        doc.entry(UPDATED_AT_FIELD.to_string()).or_insert(now);
        Ok(doc)
    }

    fn matching(docs: &[Document], filter: &Filter) -> Result<Vec<usize>> {
        let compiled = filter.compile()?;
        Ok(docs
            .iter()
            .enumerate()
            .filter(|(_, d)| compiled.matches(d))
            .map(|(i, _)| i)
            .collect())
    }

    fn update_where(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        only_first: bool,
    ) -> Result<UpdateResult> {
        let mut inner = self.inner.write();
        let Some(coll) = inner.collections.get_mut(collection) else {
            return Ok(UpdateResult::default());
        };
        let mut hits = Self::matching(&coll.docs, filter)?;
        if only_first {
            hits.truncate(1);
        }
        // stage every change first so a constraint failure leaves nothing applied
        let mut touched: Vec<usize> = Vec::new();
        let mut staged: Vec<Document> = Vec::new();
        for &i in &hits {
            let before = &coll.docs[i];
            let mut after = before.clone();
            apply_update(&mut after, update)?;
            if after != *before {
                after.insert(UPDATED_AT_FIELD.to_string(), now_timestamp());
                touched.push(i);
                staged.push(after);
            }
        }
        // old versions of touched rows are replaced, so only untouched rows
        // and earlier staged rows can clash
        for (n, doc) in staged.iter().enumerate() {
            coll.check_unique(collection, doc, &touched, &staged[..n])?;
        }
        let modified = staged.len() as u64;
        for (i, doc) in touched.into_iter().zip(staged) {
            coll.docs[i] = doc;
        }
        Ok(UpdateResult {
            matched: hits.len() as u64,
            modified,
        })
    }

    fn delete_where(&self, collection: &str, filter: &Filter, only_first: bool) -> Result<u64> {
        let mut inner = self.inner.write();
        let Some(coll) = inner.collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut hits = Self::matching(&coll.docs, filter)?;
        if only_first {
            hits.truncate(1);
        }
        let removed = hits.len() as u64;
        let mut idx = 0usize;
        coll.docs.retain(|_| {
            let keep = !hits.contains(&idx);
            idx += 1;
            keep
        });
        Ok(removed)
    }
}

fn apply_update(doc: &mut Document, update: &Update) -> Result<()> {
    for (path, value) in &update.set {
        if path == ID_FIELD {
            return Err(StateError::Invalid(format!("{ID_FIELD} is immutable")));
        }
        set_path(doc, path, value.clone())?;
    }
    for (path, values) in &update.pull {
        if let Some(JsonValue::Array(items)) = get_path_mut(doc, path) {
            items.retain(|item| !values.iter().any(|v| values_equal(item, v)));
        }
    }
    Ok(())
}

fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut JsonValue> {
    match path.split_once('.') {
        None => doc.get_mut(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(JsonValue::Object(inner)) => get_path_mut(inner, rest),
            _ => None,
        },
    }
}

fn window(docs: Vec<Document>, skip: u64, limit: Option<u64>) -> Vec<Document> {
    let skip = usize::try_from(skip).unwrap_or(usize::MAX);
    let limit = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
    docs.into_iter().skip(skip).take(limit).collect()
}

fn project_all(docs: Vec<Document>, projection: Option<&Projection>) -> Result<Vec<Document>> {
    match projection {
        None => Ok(docs),
        Some(p) => docs.iter().map(|d| p.apply(d)).collect(),
    }
}

fn run_stage(docs: Vec<Document>, stage: &Stage) -> Result<Vec<Document>> {
    match stage {
        Stage::Match(f) => {
            let compiled = f.compile()?;
            Ok(docs.into_iter().filter(|d| compiled.matches(d)).collect())
        }
        Stage::Sort(s) => {
            let mut docs = docs;
            docs.sort_by(|a, b| s.compare(a, b));
            Ok(docs)
        }
        Stage::Project(p) => project_all(docs, Some(p)),
        Stage::Facet(FacetPage {
            skip,
            limit,
            projection,
        }) => {
            let total = docs.len() as u64;
            let page = project_all(window(docs, *skip, Some(*limit)), projection.as_ref())?;
            // an empty count branch yields no metadata entry at all
            let metadata = if total > 0 {
                json!([{ TOTAL_FIELD: total }])
            } else {
                json!([])
            };
            let mut out = Document::new();
            out.insert(METADATA_FIELD.to_string(), metadata);
            out.insert(
                DATA_FIELD.to_string(),
                JsonValue::Array(page.into_iter().map(JsonValue::Object).collect()),
            );
            Ok(vec![out])
        }
        Stage::GroupCount => Ok(docs
            .into_iter()
            .map(|mut d| {
                let mut out = Document::new();
                out.insert(
                    DATA_FIELD.to_string(),
                    d.remove(DATA_FIELD).unwrap_or_else(|| json!([])),
                );
                let total = lookup(&d, &format!("{METADATA_FIELD}.{TOTAL_FIELD}"))
                    .into_iter()
                    .next()
                    .cloned();
                if let Some(total) = total {
                    out.insert(COUNT_FIELD.to_string(), total);
                }
                out
            })
            .collect()),
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStore {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<ObjectId> {
        let mut ids = self.insert_many(collection, vec![doc]).await?;
        ids.pop()
            .ok_or_else(|| StateError::Storage("insert produced no id".into()))
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<ObjectId>> {
        let prepared = docs
            .into_iter()
            .map(Self::prepare)
            .collect::<Result<Vec<_>>>()?;
        let mut inner = self.inner.write();
        let coll = inner.collections.entry(collection.to_string()).or_default();
        for (n, doc) in prepared.iter().enumerate() {
            coll.check_unique(collection, doc, &[], &prepared[..n])?;
        }
        let ids = prepared
            .iter()
            .filter_map(|d| d.get(ID_FIELD).and_then(ObjectId::from_value))
            .collect();
        coll.docs.extend(prepared);
        Ok(ids)
    }

    async fn replace_all(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<ObjectId>> {
        let prepared = docs
            .into_iter()
            .map(Self::prepare)
            .collect::<Result<Vec<_>>>()?;
        let mut inner = self.inner.write();
        let coll = inner.collections.entry(collection.to_string()).or_default();
        for (n, doc) in prepared.iter().enumerate() {
            unique_clash(collection, doc, &coll.unique, prepared[..n].iter())?;
        }
        let ids = prepared
            .iter()
            .filter_map(|d| d.get(ID_FIELD).and_then(ObjectId::from_value))
            .collect();
        let removed = std::mem::replace(&mut coll.docs, prepared).len();
        tracing::debug!(collection, removed, "collection replaced");
        Ok(ids)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        opts: FindOptions,
    ) -> Result<Vec<Document>> {
        let inner = self.inner.read();
        let Some(coll) = inner.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let compiled = filter.compile()?;
        let mut docs: Vec<Document> = coll
            .docs
            .iter()
            .filter(|d| compiled.matches(d))
            .cloned()
            .collect();
        drop(inner);
        if let Some(sort) = &opts.sort {
            docs.sort_by(|a, b| sort.compare(a, b));
        }
        project_all(window(docs, opts.skip, opts.limit), opts.projection.as_ref())
    }

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>> {
        let _timer = AGGREGATE_SECONDS
            .with_label_values(&[collection])
            .start_timer();
        let mut docs = {
            let inner = self.inner.read();
            inner
                .collections
                .get(collection)
                .map(|c| c.docs.clone())
                .unwrap_or_default()
        };
        tracing::debug!(collection, stages = pipeline.stages().len(), "aggregate");
        for stage in pipeline.stages() {
            docs = run_stage(docs, stage)?;
        }
        Ok(docs)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateResult> {
        self.update_where(collection, filter, update, true)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateResult> {
        self.update_where(collection, filter, update, false)
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.delete_where(collection, filter, true)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.delete_where(collection, filter, false)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let inner = self.inner.read();
        let Some(coll) = inner.collections.get(collection) else {
            return Ok(0);
        };
        Ok(Self::matching(&coll.docs, filter)?.len() as u64)
    }

    async fn create_unique_index(&self, collection: &str, field: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let coll = inner.collections.entry(collection.to_string()).or_default();
        if coll.unique.iter().any(|f| f == field) {
            return Ok(());
        }
        coll.unique.push(field.to_string());
        let clash = coll
            .docs
            .iter()
            .enumerate()
            .find_map(|(i, doc)| coll.check_unique(collection, doc, &[i], &[]).err());
        if let Some(e) = clash {
            coll.unique.retain(|f| f != field);
            return Err(e);
        }
        Ok(())
    }

    fn collection_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.collections.keys().cloned().collect();
        names.sort();
        names
    }

    fn all_documents(&self, collection: &str) -> Vec<Document> {
        let inner = self.inner.read();
        inner
            .collections
            .get(collection)
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }
}
