use bazaar_catalog::{Catalog, SlugAllocator};
use bazaar_core::{document_id, Document, QueryRequest, Stage};
use bazaar_storage::{InMemoryStore, Storage};
use rstest::rstest;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::sync::Arc;

fn doc(v: JsonValue) -> Document {
    match v {
        JsonValue::Object(m) => m,
        _ => panic!("not an object"),
    }
}

fn request(v: JsonValue) -> QueryRequest {
    serde_json::from_value(v).expect("valid request")
}

async fn catalog() -> (Arc<InMemoryStore>, Catalog) {
    let store = Arc::new(InMemoryStore::new());
    let catalog = Catalog::marketplace(store.clone(), SlugAllocator::default())
        .await
        .expect("catalog");
    (store, catalog)
}

/// Ten brands created a day apart; even days are published.
async fn seeded_brands() -> (Arc<InMemoryStore>, Catalog) {
    let (store, catalog) = catalog().await;
    let brands = catalog.service("brand").unwrap();
    for day in 1..=10 {
        let status = if day % 2 == 0 { "publish" } else { "draft" };
        brands
            .add(doc(json!({
                "name": format!("Brand {day}"),
                "status": status,
                "createdAt": format!("2024-01-{day:02}T00:00:00.000Z"),
            })))
            .await
            .unwrap();
    }
    (store, catalog)
}

#[tokio::test]
async fn empty_filter_scans_everything() {
    let (store, catalog) = seeded_brands().await;
    let brands = catalog.service("brand").unwrap();
    let req = request(json!({"filter": {}}));

    let pipeline = brands.explain(&req, None).unwrap();
    assert!(!matches!(pipeline.stages()[0], Stage::Match(_)));

    let env = brands.get_all(&req, None).await.unwrap();
    let got: HashSet<_> = env.data.unwrap().iter().filter_map(document_id).collect();
    let all: HashSet<_> = store
        .all_documents("brands")
        .iter()
        .filter_map(document_id)
        .collect();
    assert_eq!(got, all);
    assert_eq!(env.count, Some(10));
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(5)]
#[case(9)]
#[tokio::test]
async fn pages_add_up_to_the_total(#[case] page_size: u64) {
    let (_, catalog) = seeded_brands().await;
    let brands = catalog.service("brand").unwrap();
    // five published brands
    let n = 5u64;
    let pages = n.div_ceil(page_size);
    let mut seen = Vec::new();
    for page in 0..pages {
        let req = request(json!({
            "filter": {"status": "publish"},
            "pagination": {"pageSize": page_size, "currentPage": page},
        }));
        let env = brands.get_all(&req, None).await.unwrap();
        assert_eq!(env.count, Some(n), "page {page}");
        seen.extend(env.data.unwrap().iter().filter_map(document_id));
    }
    assert_eq!(seen.len() as u64, n);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len() as u64, n);
}

#[tokio::test]
async fn newest_published_page() {
    let (_, catalog) = catalog().await;
    let cats = catalog.service("category").unwrap();
    for day in 1..=5 {
        cats.add(doc(json!({
            "name": format!("Category {day}"),
            "status": "publish",
            "createdAt": format!("2024-02-{day:02}T00:00:00.000Z"),
        })))
        .await
        .unwrap();
    }
    let req = request(json!({
        "filter": {"status": "publish"},
        "sort": {"createdAt": -1},
        "pagination": {"pageSize": 2, "currentPage": 0},
    }));
    let env = cats.get_all(&req, None).await.unwrap();
    assert!(env.success);
    assert_eq!(env.count, Some(5));
    let names: Vec<_> = env.data.unwrap().iter().map(|d| d["name"].clone()).collect();
    assert_eq!(names, vec![json!("Category 5"), json!("Category 4")]);
}

#[tokio::test]
async fn search_term_narrows_by_display_name() {
    let (_, catalog) = seeded_brands().await;
    let brands = catalog.service("brand").unwrap();
    let env = brands
        .get_all(&QueryRequest::default(), Some("brand 1"))
        .await
        .unwrap();
    // "Brand 1" and "Brand 10"
    assert_eq!(env.count, Some(2));
}

#[tokio::test]
async fn colliding_names_get_distinct_slugs() {
    let (store, catalog) = catalog().await;
    let brands = catalog.service("brand").unwrap();
    for name in ["Acme", "ACME", "acme!", "Acme", "a c m e"] {
        brands.add(doc(json!({ "name": name }))).await.unwrap();
    }
    brands
        .insert_many(vec![doc(json!({"name": "Acme"})), doc(json!({"name": "acme"}))], false)
        .await
        .unwrap();
    let slugs: Vec<_> = store
        .all_documents("brands")
        .iter()
        .map(|d| d["slug"].as_str().unwrap().to_string())
        .collect();
    let distinct: HashSet<_> = slugs.iter().collect();
    assert_eq!(slugs.len(), 7);
    assert_eq!(distinct.len(), slugs.len(), "{slugs:?}");
}

#[tokio::test]
async fn mixed_projection_is_rejected() {
    let (_, catalog) = seeded_brands().await;
    let brands = catalog.service("brand").unwrap();
    let req = request(json!({"select": {"name": 1, "status": 0}}));
    let err = brands.get_all(&req, None).await.unwrap_err();
    assert_eq!(err.kind(), bazaar_core::ErrorKind::Validation);
}
