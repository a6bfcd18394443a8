use crate::executor::execute;
use crate::integrity::{BulkDeleteOutcome, ReferenceIntegrityManager};
use crate::schema::EntitySchema;
use crate::slug::SlugAllocator;
use bazaar_core::{
    document_id, is_read_only, snapshot_of, Document, Filter, ObjectId, Pipeline, Predicate,
    Projection, QueryCompiler, QueryRequest, Result, ResultEnvelope, StateError, CREATED_AT_FIELD,
    ID_FIELD, READ_ONLY_FIELD, SLUG_FIELD, STATUS_FIELD, UPDATED_AT_FIELD,
};
use bazaar_storage::{FindOptions, Storage, Update};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Arc;

/// A lost slug race is retried once with a fresh allocation.
const INSERT_ROUNDS: u32 = 2;

const IMMUTABLE_FIELDS: [&str; 4] = [ID_FIELD, READ_ONLY_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Created {
    #[serde(rename = "_id")]
    pub id: ObjectId,
}

/// The generic CRUD surface shared by every entity type.
pub struct EntityService {
    schema: Arc<EntitySchema>,
    store: Arc<dyn Storage>,
    slugs: SlugAllocator,
    integrity: ReferenceIntegrityManager,
    compiler: QueryCompiler,
}

impl EntityService {
    pub fn new(schema: EntitySchema, store: Arc<dyn Storage>, slugs: SlugAllocator) -> Self {
        let compiler = schema.compiler();
        Self {
            integrity: ReferenceIntegrityManager::new(store.clone()),
            schema: Arc::new(schema),
            store,
            slugs,
            compiler,
        }
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    pub async fn add(&self, mut doc: Document) -> Result<ResultEnvelope<Created>> {
        let collection = &self.schema.collection;
        if !self.schema.slugged {
            let id = self.store.insert_one(collection, doc).await?;
            return Ok(ResultEnvelope::ok("Created successfully").with_data(Created { id }));
        }
        let source = self.slug_source(&doc)?;
        let mut round = 1;
        loop {
            let slug = self.slugs.allocate(&*self.store, collection, &source).await?;
            doc.insert(SLUG_FIELD.to_string(), JsonValue::String(slug.clone()));
            match self.store.insert_one(collection, doc.clone()).await {
                Ok(id) => {
                    tracing::info!(entity = %self.schema.name, %id, %slug, "created");
                    return Ok(ResultEnvelope::ok("Created successfully").with_data(Created { id }));
                }
                Err(e) if round < INSERT_ROUNDS && e.is_unique_violation_on(SLUG_FIELD) => {
                    tracing::warn!(entity = %self.schema.name, %slug, "slug claimed concurrently, retrying");
                    round += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Inserts a batch, all or nothing. With `reset` the batch replaces the
    /// whole collection, read-only rows included; a rejected batch leaves
    /// the collection untouched.
    pub async fn insert_many(
        &self,
        mut docs: Vec<Document>,
        reset: bool,
    ) -> Result<ResultEnvelope<()>> {
        let collection = &self.schema.collection;
        if self.schema.slugged {
            let sources = docs
                .iter()
                .map(|d| self.slug_source(d))
                .collect::<Result<Vec<_>>>()?;
            let mut reserved = HashSet::new();
            for (doc, source) in docs.iter_mut().zip(&sources) {
                let slug = if reset {
                    self.slugs.allocate_fresh(source, &reserved)?
                } else {
                    self.slugs
                        .allocate_for(&*self.store, collection, source, None, &reserved)
                        .await?
                };
                reserved.insert(slug.clone());
                doc.insert(SLUG_FIELD.to_string(), JsonValue::String(slug));
            }
        }
        let ids = if reset {
            let ids = self.store.replace_all(collection, docs).await?;
            tracing::info!(entity = %self.schema.name, inserted = ids.len(), "collection reset");
            ids
        } else {
            let ids = self.store.insert_many(collection, docs).await?;
            tracing::info!(entity = %self.schema.name, inserted = ids.len(), "batch inserted");
            ids
        };
        Ok(ResultEnvelope::ok("Inserted successfully").with_count(ids.len() as u64))
    }

    pub fn explain(&self, req: &QueryRequest, search: Option<&str>) -> Result<Pipeline> {
        self.compiler.compile(req, search)
    }

    pub async fn get_all(
        &self,
        req: &QueryRequest,
        search: Option<&str>,
    ) -> Result<ResultEnvelope<Vec<Document>>> {
        let pipeline = self.compiler.compile(req, search)?;
        execute(&*self.store, &self.schema.collection, &pipeline).await
    }

    pub async fn get_by_id(
        &self,
        id: &ObjectId,
        select: Option<Projection>,
    ) -> Result<ResultEnvelope<Document>> {
        self.get_one(&Filter::by_id(id), select).await
    }

    pub async fn get_by_slug(
        &self,
        slug: &str,
        select: Option<Projection>,
    ) -> Result<ResultEnvelope<Document>> {
        self.get_by_field(SLUG_FIELD, JsonValue::String(slug.to_string()), select)
            .await
    }

    /// First row whose `path` equals `value`, e.g. a SEO page by `pageName`.
    pub async fn get_by_field(
        &self,
        path: &str,
        value: JsonValue,
        select: Option<Projection>,
    ) -> Result<ResultEnvelope<Document>> {
        self.get_one(&Filter::eq(path, value), select)
            .await
    }

    /// Every row whose `path` equals `value`, in natural order. Embedded
    /// snapshot ids are matched with `<link>._id`.
    pub async fn find_by_field(
        &self,
        path: &str,
        value: JsonValue,
        select: Option<Projection>,
    ) -> Result<ResultEnvelope<Vec<Document>>> {
        self.find_many(&Filter::eq(path, value), select)
            .await
    }

    pub async fn get_by_ids(
        &self,
        ids: &[ObjectId],
        select: Option<Projection>,
    ) -> Result<ResultEnvelope<Vec<Document>>> {
        if ids.is_empty() {
            return Err(StateError::Invalid("no ids given".into()));
        }
        self.find_many(&Filter::ids_in(ID_FIELD, ids), select).await
    }

    async fn find_many(
        &self,
        filter: &Filter,
        select: Option<Projection>,
    ) -> Result<ResultEnvelope<Vec<Document>>> {
        let rows = self
            .store
            .find(&self.schema.collection, filter, FindOptions::projected(checked(select)?))
            .await?;
        let count = rows.len() as u64;
        Ok(ResultEnvelope::ok("Success").with_data(rows).with_count(count))
    }

    async fn get_one(
        &self,
        filter: &Filter,
        select: Option<Projection>,
    ) -> Result<ResultEnvelope<Document>> {
        let found = self
            .store
            .find(&self.schema.collection, filter, FindOptions {
                limit: Some(1),
                ..FindOptions::projected(checked(select)?)
            })
            .await?;
        match found.into_iter().next() {
            Some(doc) => Ok(ResultEnvelope::ok("Success").with_data(doc)),
            None => Err(StateError::NotFound(self.schema.name.clone())),
        }
    }

    /// Applies a partial update. Renames reallocate the slug and refresh
    /// every embedded copy of this entity.
    pub async fn update_by_id(
        &self,
        id: &ObjectId,
        mut patch: Document,
    ) -> Result<ResultEnvelope<()>> {
        check_patch(&patch)?;
        let current = self.require(id).await?;
        if is_read_only(&current) {
            tracing::warn!(entity = %self.schema.name, %id, "refusing to update read only row");
            return Err(StateError::Protected(format!("{} {id}", self.schema.name)));
        }
        if self.schema.slugged {
            if let Some(source) = self.rename_source(&current, &patch)? {
                let slug = self
                    .slugs
                    .allocate_for(&*self.store, &self.schema.collection, &source, Some(id), &HashSet::new())
                    .await?;
                patch.insert(SLUG_FIELD.to_string(), JsonValue::String(slug));
            }
        }
        let status = patch.get(STATUS_FIELD).cloned();
        let filter = Filter::by_id(id).with(READ_ONLY_FIELD, Predicate::Ne(JsonValue::Bool(true)));
        let res = self
            .store
            .update_one(&self.schema.collection, &filter, &Update::from_document(patch))
            .await?;
        if res.matched == 0 {
            return Err(StateError::NotFound(format!("{} {id}", self.schema.name)));
        }

        let updated = self.require(id).await?;
        let fields = self.schema.snapshot_fields();
        if !fields.is_empty() && snapshot_of(&current, &fields) != snapshot_of(&updated, &fields) {
            self.integrity.on_rename(&self.schema, id, &updated).await?;
        }
        if let Some(status) = status {
            if current.get(STATUS_FIELD) != Some(&status) {
                self.integrity
                    .on_status_change(&self.schema, std::slice::from_ref(id), &status)
                    .await?;
            }
        }
        Ok(ResultEnvelope::ok("Updated successfully"))
    }

    /// Applies one patch to many rows. Read-only rows are skipped, the
    /// display name may not change and any `slug` in the patch is dropped.
    pub async fn update_many(
        &self,
        ids: &[ObjectId],
        mut patch: Document,
    ) -> Result<ResultEnvelope<()>> {
        check_patch(&patch)?;
        if patch.contains_key(&self.schema.display_field) {
            return Err(StateError::Invalid(format!(
                "{} can not be changed in bulk",
                self.schema.display_field
            )));
        }
        patch.remove(SLUG_FIELD);
        if patch.is_empty() {
            return Err(StateError::Invalid("nothing to update".into()));
        }
        self.patch_many(ids, patch, "Updated").await
    }

    pub async fn change_status(
        &self,
        ids: &[ObjectId],
        status: JsonValue,
    ) -> Result<ResultEnvelope<()>> {
        let mut patch = Document::new();
        patch.insert(STATUS_FIELD.to_string(), status);
        self.patch_many(ids, patch, "Status changed").await
    }

    async fn patch_many(
        &self,
        ids: &[ObjectId],
        patch: Document,
        verb: &str,
    ) -> Result<ResultEnvelope<()>> {
        let (targets, protected) = self.partition_read_only(ids).await?;
        let message = if protected.is_empty() {
            format!("{verb} successfully")
        } else {
            tracing::warn!(entity = %self.schema.name, skipped = protected.len(), "bulk update skipped read only rows");
            format!("{verb} successfully, {} read only skipped", protected.len())
        };
        if targets.is_empty() {
            return Ok(ResultEnvelope::ok(message).with_count(0));
        }
        let status = patch.get(STATUS_FIELD).cloned();
        let filter = Filter::ids_in(ID_FIELD, &targets)
            .with(READ_ONLY_FIELD, Predicate::Ne(JsonValue::Bool(true)));
        let res = self
            .store
            .update_many(&self.schema.collection, &filter, &Update::from_document(patch))
            .await?;
        if let Some(status) = status {
            self.integrity
                .on_status_change(&self.schema, &targets, &status)
                .await?;
        }
        tracing::info!(entity = %self.schema.name, modified = res.modified, "bulk updated");
        Ok(ResultEnvelope::ok(message).with_count(res.modified))
    }

    pub async fn delete_by_id(&self, id: &ObjectId, cascade: bool) -> Result<ResultEnvelope<()>> {
        self.integrity.on_delete(&self.schema, id, cascade).await?;
        Ok(ResultEnvelope::ok("Deleted successfully"))
    }

    pub async fn delete_many(
        &self,
        ids: &[ObjectId],
        cascade: bool,
    ) -> Result<ResultEnvelope<BulkDeleteOutcome>> {
        if ids.is_empty() {
            return Err(StateError::Invalid("no ids given".into()));
        }
        let outcome = self.integrity.on_bulk_delete(&self.schema, ids, cascade).await?;
        let deleted = outcome.deleted;
        Ok(ResultEnvelope::ok("Deleted successfully")
            .with_data(outcome)
            .with_count(deleted))
    }

    async fn require(&self, id: &ObjectId) -> Result<Document> {
        self.store
            .find_by_id(&self.schema.collection, id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("{} {id}", self.schema.name)))
    }

    /// Splits the existing rows among `ids` into editable and read-only ids.
    async fn partition_read_only(&self, ids: &[ObjectId]) -> Result<(Vec<ObjectId>, Vec<ObjectId>)> {
        let opts = FindOptions::projected(Some(Projection::include([ID_FIELD, READ_ONLY_FIELD])));
        let rows = self
            .store
            .find(&self.schema.collection, &Filter::ids_in(ID_FIELD, ids), opts)
            .await?;
        let (locked, open): (Vec<_>, Vec<_>) = rows.iter().partition(|d| is_read_only(d));
        Ok((
            open.into_iter().filter_map(document_id).collect(),
            locked.into_iter().filter_map(document_id).collect(),
        ))
    }

    /// An explicit `slug` wins over the display name as slug base.
    fn slug_source(&self, doc: &Document) -> Result<String> {
        if let Some(v) = doc.get(SLUG_FIELD) {
            return match v.as_str() {
                Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
                _ => Err(StateError::Invalid("slug must be a non-empty string".into())),
            };
        }
        match doc.get(&self.schema.display_field) {
            Some(JsonValue::String(name)) if !name.trim().is_empty() => Ok(name.clone()),
            _ => Err(StateError::Invalid(format!(
                "{} is required",
                self.schema.display_field
            ))),
        }
    }

    /// Slug base for an update, if the slug has to be reallocated.
    fn rename_source(&self, current: &Document, patch: &Document) -> Result<Option<String>> {
        if patch.contains_key(SLUG_FIELD) {
            return self.slug_source(patch).map(Some);
        }
        match patch.get(&self.schema.display_field) {
            None => Ok(None),
            Some(JsonValue::String(name)) if name.trim().is_empty() => Err(StateError::Invalid(
                format!("{} can not be empty", self.schema.display_field),
            )),
            Some(JsonValue::String(name)) => {
                let unchanged = current.get(&self.schema.display_field) == Some(&JsonValue::String(name.clone()));
                Ok((!unchanged).then(|| name.clone()))
            }
            Some(_) => Err(StateError::Invalid(format!(
                "{} must be a string",
                self.schema.display_field
            ))),
        }
    }
}

/// An empty selection means "everything"; mixed selections are rejected.
fn checked(select: Option<Projection>) -> Result<Option<Projection>> {
    let select = select.filter(|p| !p.is_empty());
    if let Some(p) = &select {
        p.mode()?;
    }
    Ok(select)
}

fn check_patch(patch: &Document) -> Result<()> {
    if patch.is_empty() {
        return Err(StateError::Invalid("nothing to update".into()));
    }
    match IMMUTABLE_FIELDS.iter().find(|f| patch.contains_key(**f)) {
        Some(f) => Err(StateError::Invalid(format!("{f} can not be changed"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::marketplace;
    use bazaar_storage::{InMemoryStore, UpdateResult};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn doc(v: JsonValue) -> Document {
        match v {
            JsonValue::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn service(name: &str) -> (Arc<InMemoryStore>, EntityService) {
        let store = Arc::new(InMemoryStore::new());
        let schema = marketplace()
            .into_iter()
            .find(|s| s.name == name)
            .expect("registered");
        let svc = EntityService::new(schema, store.clone(), SlugAllocator::default());
        (store, svc)
    }

    #[tokio::test]
    async fn add_derives_slug_from_name() {
        let (_, svc) = service("brand");
        let first = svc.add(doc(json!({"name": "Acme Tools"}))).await.unwrap();
        let second = svc.add(doc(json!({"name": "Acme  tools!"}))).await.unwrap();
        let a = svc.get_by_id(&first.data.unwrap().id, None).await.unwrap();
        let b = svc.get_by_id(&second.data.unwrap().id, None).await.unwrap();
        assert_eq!(a.data.unwrap()["slug"], json!("acme-tools"));
        assert_eq!(b.data.unwrap()["slug"], json!("acme-tools-1"));
    }

    #[tokio::test]
    async fn add_requires_a_display_name() {
        let (_, svc) = service("brand");
        let err = svc.add(doc(json!({"image": "x.png"}))).await.unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
    }

    #[tokio::test]
    async fn batch_slugs_do_not_collide() {
        let (store, svc) = service("category");
        let env = svc
            .insert_many(
                vec![doc(json!({"name": "Books"})), doc(json!({"name": "books"}))],
                false,
            )
            .await
            .unwrap();
        assert_eq!(env.count, Some(2));
        let slugs: Vec<_> = store
            .all_documents("categories")
            .iter()
            .map(|d| d["slug"].clone())
            .collect();
        assert_eq!(slugs, vec![json!("books"), json!("books-1")]);
    }

    #[tokio::test]
    async fn immutable_fields_are_rejected() {
        let (_, svc) = service("brand");
        let id = svc.add(doc(json!({"name": "Acme"}))).await.unwrap().data.unwrap().id;
        for field in ["_id", "readOnly", "createdAt"] {
            let mut patch = Document::new();
            patch.insert(field.to_string(), json!(true));
            let err = svc.update_by_id(&id, patch).await.unwrap_err();
            assert!(matches!(err, StateError::Invalid(_)), "{field}");
        }
    }

    #[tokio::test]
    async fn bulk_update_skips_slug_and_rejects_name() {
        let (store, svc) = service("brand");
        let id = svc.add(doc(json!({"name": "Acme"}))).await.unwrap().data.unwrap().id;
        let err = svc
            .update_many(&[id], doc(json!({"name": "Other"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        let env = svc
            .update_many(&[id], doc(json!({"slug": "hijack", "image": "a.png"})))
            .await
            .unwrap();
        assert_eq!(env.count, Some(1));
        let row = store.find_by_id("brands", &id).await.unwrap().unwrap();
        assert_eq!(row["slug"], json!("acme"));
        assert_eq!(row["image"], json!("a.png"));
    }

    #[tokio::test]
    async fn get_by_slug_projects_and_misses() {
        let (_, svc) = service("brand");
        svc.add(doc(json!({"name": "Acme", "image": "a.png"}))).await.unwrap();
        let env = svc
            .get_by_slug("acme", Some(Projection::include(["image"])))
            .await
            .unwrap();
        let data = env.data.unwrap();
        assert_eq!(data.get("image"), Some(&json!("a.png")));
        assert!(!data.contains_key("name"));
        let err = svc.get_by_slug("nope", None).await.unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[tokio::test]
    async fn unslugged_entities_insert_verbatim() {
        let (store, svc) = service("reward");
        svc.add(doc(json!({"name": "Gold", "points": 100}))).await.unwrap();
        let rows = store.all_documents("rewards");
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].contains_key("slug"));
    }

    /// Reports a slug clash on the first `lost` inserts, as if another
    /// writer had claimed the checked slug in between.
    struct ContestedSlugs {
        inner: InMemoryStore,
        lost: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Storage for ContestedSlugs {
        async fn insert_one(&self, collection: &str, doc: Document) -> Result<ObjectId> {
            let lose = self
                .lost
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lose {
                return Err(StateError::UniqueViolation {
                    collection: collection.to_string(),
                    field: SLUG_FIELD.to_string(),
                    value: doc[SLUG_FIELD].to_string(),
                });
            }
            self.inner.insert_one(collection, doc).await
        }
        async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<ObjectId>> {
            self.inner.insert_many(collection, docs).await
        }
        async fn replace_all(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<ObjectId>> {
            self.inner.replace_all(collection, docs).await
        }
        async fn find(&self, collection: &str, filter: &Filter, opts: FindOptions) -> Result<Vec<Document>> {
            self.inner.find(collection, filter, opts).await
        }
        async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>> {
            self.inner.aggregate(collection, pipeline).await
        }
        async fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
            self.inner.update_one(collection, filter, update).await
        }
        async fn update_many(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
            self.inner.update_many(collection, filter, update).await
        }
        async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
            self.inner.delete_one(collection, filter).await
        }
        async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
            self.inner.delete_many(collection, filter).await
        }
        async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
            self.inner.count(collection, filter).await
        }
        async fn create_unique_index(&self, collection: &str, field: &str) -> Result<()> {
            self.inner.create_unique_index(collection, field).await
        }
        fn collection_names(&self) -> Vec<String> {
            self.inner.collection_names()
        }
        fn all_documents(&self, collection: &str) -> Vec<Document> {
            self.inner.all_documents(collection)
        }
    }

    fn contested(lost: u32) -> (Arc<ContestedSlugs>, EntityService) {
        let store = Arc::new(ContestedSlugs {
            inner: InMemoryStore::new(),
            lost: AtomicU32::new(lost),
        });
        let schema = marketplace()
            .into_iter()
            .find(|s| s.name == "brand")
            .expect("registered");
        let svc = EntityService::new(schema, store.clone(), SlugAllocator::default());
        (store, svc)
    }

    #[tokio::test]
    async fn lost_slug_race_is_retried_once() {
        let (store, svc) = contested(1);
        let env = svc.add(doc(json!({"name": "Acme"}))).await.unwrap();
        let id = env.data.unwrap().id;
        let row = store.find_by_id("brands", &id).await.unwrap().unwrap();
        assert_eq!(row["slug"], json!("acme"));
        assert_eq!(store.lost.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_lost_race_is_a_conflict() {
        let (store, svc) = contested(2);
        let err = svc.add(doc(json!({"name": "Acme"}))).await.unwrap_err();
        assert_eq!(err.kind(), bazaar_core::ErrorKind::Conflict);
        assert!(err.is_unique_violation_on(SLUG_FIELD));
        assert!(store.all_documents("brands").is_empty());
    }
}
