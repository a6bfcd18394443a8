//! Read-only storefront and dashboard views spanning several collections.

use crate::schema::{CATEGORIES, CHILD_CATEGORIES, PRODUCTS, SUB_CATEGORIES};
use crate::Catalog;
use bazaar_core::{
    document_id, is_read_only, lookup, Document, Filter, ObjectId, Predicate, Result,
    ResultEnvelope, ID_FIELD, READ_ONLY_FIELD, STATUS_FIELD,
};
use bazaar_storage::FindOptions;
use futures::future::try_join_all;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

pub const PUBLISHED: &str = "publish";

const CATEGORY_CARD: [&str; 7] = [
    ID_FIELD,
    "name",
    "image",
    "slug",
    READ_ONLY_FIELD,
    "serial",
    STATUS_FIELD,
];
const CATEGORY_NODE: [&str; 7] = [
    ID_FIELD,
    "name",
    "nameBn",
    "nameIt",
    "mobileImage",
    "image",
    "slug",
];
const LEAF_NODE: [&str; 6] = [ID_FIELD, "image", "name", "nameBn", "nameIt", "slug"];

/// Dashboard post counters: response key and stored `postType`.
const POST_TYPES: [(&str, &str); 4] = [
    ("matrimonial", "matrimonial"),
    ("products", "products"),
    ("toLet", "to_let"),
    ("job", "job_post"),
];

impl Catalog {
    /// Published child categories grouped under their published, editable
    /// parent category. Groups keep the order their first child was stored.
    pub async fn child_categories_by_category(&self) -> Result<ResultEnvelope<Vec<Document>>> {
        let filter = published().with(READ_ONLY_FIELD, Predicate::Ne(JsonValue::Bool(true)));
        let children = self.rows(CHILD_CATEGORIES, filter).await?;
        let (order, mut groups) = group_by(children, "category._id");

        let parents = self
            .rows(CATEGORIES, Filter::ids_in(ID_FIELD, &order))
            .await?
            .into_iter()
            .filter_map(|c| document_id(&c).map(|id| (id, c)))
            .collect::<HashMap<_, _>>();

        let mut out = Vec::new();
        for id in order {
            let Some(parent) = parents.get(&id) else {
                continue;
            };
            if is_read_only(parent) || !is_published(parent) {
                continue;
            }
            let mut card = pick(parent, &CATEGORY_CARD);
            let members = groups.remove(&id).unwrap_or_default();
            card.insert(CHILD_CATEGORIES.to_string(), array(members));
            out.push(card);
        }
        let count = out.len() as u64;
        Ok(ResultEnvelope::ok("Success").with_data(out).with_count(count))
    }

    /// The published category -> sub category -> child category tree.
    pub async fn category_tree(&self) -> Result<ResultEnvelope<Vec<Document>>> {
        let (categories, subs, children) = futures::try_join!(
            self.rows(CATEGORIES, published()),
            self.rows(SUB_CATEGORIES, published()),
            self.rows(CHILD_CATEGORIES, published()),
        )?;
        let (_, mut subs_of) = group_by(subs, "category._id");
        let (_, mut children_of) = group_by(children, "subCategory._id");

        let tree = categories
            .iter()
            .map(|cat| {
                let subs = document_id(cat)
                    .and_then(|id| subs_of.remove(&id))
                    .unwrap_or_default()
                    .iter()
                    .map(|sub| {
                        let leaves = document_id(sub)
                            .and_then(|id| children_of.remove(&id))
                            .unwrap_or_default()
                            .iter()
                            .map(|c| pick(c, &LEAF_NODE))
                            .collect();
                        let mut node = pick(sub, &LEAF_NODE);
                        node.insert(CHILD_CATEGORIES.to_string(), array(leaves));
                        node
                    })
                    .collect();
                let mut node = pick(cat, &CATEGORY_NODE);
                node.insert(SUB_CATEGORIES.to_string(), array(subs));
                node
            })
            .collect::<Vec<_>>();
        let count = tree.len() as u64;
        Ok(ResultEnvelope::ok("Success").with_data(tree).with_count(count))
    }

    /// Product counts per post type.
    pub async fn post_counts(&self) -> Result<ResultEnvelope<Document>> {
        let filters: Vec<Filter> = POST_TYPES
            .iter()
            .map(|(_, stored)| Filter::eq("postType", JsonValue::String(stored.to_string())))
            .collect();
        let counts = try_join_all(filters.iter().map(|f| self.store.count(PRODUCTS, f))).await?;
        let data = POST_TYPES
            .iter()
            .zip(counts)
            .map(|((key, _), n)| (key.to_string(), JsonValue::from(n)))
            .collect();
        Ok(ResultEnvelope::ok("Success").with_data(data))
    }

    async fn rows(&self, collection: &str, filter: Filter) -> Result<Vec<Document>> {
        self.store
            .find(collection, &filter, FindOptions::default())
            .await
    }
}

fn published() -> Filter {
    Filter::eq(STATUS_FIELD, JsonValue::String(PUBLISHED.to_string()))
}

fn is_published(doc: &Document) -> bool {
    doc.get(STATUS_FIELD).and_then(JsonValue::as_str) == Some(PUBLISHED)
}

/// Buckets `docs` by the object id at `path`. Rows without one are dropped.
fn group_by(
    docs: Vec<Document>,
    path: &str,
) -> (Vec<ObjectId>, HashMap<ObjectId, Vec<Document>>) {
    let mut order = Vec::new();
    let mut groups: HashMap<ObjectId, Vec<Document>> = HashMap::new();
    for doc in docs {
        let Some(key) = lookup(&doc, path).first().and_then(|v| ObjectId::from_value(v)) else {
            continue;
        };
        groups
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(doc);
    }
    (order, groups)
}

fn pick(doc: &Document, fields: &[&str]) -> Document {
    fields
        .iter()
        .filter_map(|f| doc.get(*f).map(|v| (f.to_string(), v.clone())))
        .collect()
}

fn array(docs: Vec<Document>) -> JsonValue {
    JsonValue::Array(docs.into_iter().map(JsonValue::Object).collect())
}
