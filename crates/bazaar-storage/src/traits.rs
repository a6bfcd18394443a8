use bazaar_core::{Document, Filter, ObjectId, Pipeline, Projection, Result, SortSpec};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<SortSpec>,
    pub projection: Option<Projection>,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn projected(projection: Option<Projection>) -> Self {
        Self {
            projection,
            ..Self::default()
        }
    }
}

/// Partial mutation: `$set` on dotted paths and `$pull` of array elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Vec<(String, JsonValue)>,
    pub pull: Vec<(String, Vec<JsonValue>)>,
}

impl Update {
    pub fn set(path: impl Into<String>, value: JsonValue) -> Self {
        Self::default().and_set(path, value)
    }

    pub fn and_set(mut self, path: impl Into<String>, value: JsonValue) -> Self {
        self.set.push((path.into(), value));
        self
    }

    pub fn pull(path: impl Into<String>, values: Vec<JsonValue>) -> Self {
        Self {
            set: Vec::new(),
            pull: vec![(path.into(), values)],
        }
    }

    pub fn from_document(doc: Document) -> Self {
        Self {
            set: doc.into_iter().collect(),
            pull: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.pull.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

/// Document collection access. Every multi-document call is atomic per
/// collection; nothing spans collections.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<ObjectId>;
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<ObjectId>>;
    /// Swaps the whole content of `collection` for `docs`. Nothing changes
    /// unless every document is accepted.
    async fn replace_all(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<ObjectId>>;
    async fn find(&self, collection: &str, filter: &Filter, opts: FindOptions)
        -> Result<Vec<Document>>;
    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>>;
    async fn update_one(&self, collection: &str, filter: &Filter, update: &Update)
        -> Result<UpdateResult>;
    async fn update_many(&self, collection: &str, filter: &Filter, update: &Update)
        -> Result<UpdateResult>;
    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64>;
    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64>;
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;
    async fn create_unique_index(&self, collection: &str, field: &str) -> Result<()>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        let opts = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        Ok(self.find(collection, filter, opts).await?.into_iter().next())
    }

    async fn find_by_id(&self, collection: &str, id: &ObjectId) -> Result<Option<Document>> {
        self.find_one(collection, &Filter::by_id(id)).await
    }

    // Admin export
    fn collection_names(&self) -> Vec<String>;
    fn all_documents(&self, collection: &str) -> Vec<Document>;
}
