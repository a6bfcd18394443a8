use crate::error::ApiError;
use crate::{metrics, persist};
use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use bazaar_catalog::{BulkDeleteOutcome, Catalog, Created};
use bazaar_core::{
    Document, ObjectId, Projection, QueryRequest, ResultEnvelope, StateError,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub data_dir: Option<PathBuf>,
}

type ApiResult<T> = Result<Json<ResultEnvelope<T>>, ApiError>;

/// JSON body whose rejections become failure envelopes.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct JsonBody<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct Params<T>(pub T);

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SelectParams {
    pub select: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetParams {
    #[serde(default)]
    pub delete_many: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageParams {
    #[serde(default)]
    pub check_usage: bool,
}

#[derive(Debug, Deserialize)]
pub struct IdsBody {
    pub ids: Vec<ObjectId>,
}

#[derive(Debug, Deserialize)]
pub struct BulkPatch {
    pub ids: Vec<ObjectId>,
    pub data: Document,
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub ids: Vec<ObjectId>,
    pub status: JsonValue,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/admin/snapshot", post(admin_snapshot))
        .route("/admin/explain/:entity", post(admin_explain))
        .route("/api/:entity/add", post(add))
        .route("/api/:entity/insert-many", post(insert_many))
        .route("/api/:entity/get-all", post(get_all))
        .route("/api/:entity/get-by/:slug", get(get_by_slug))
        .route("/api/:entity/get-by-ids", post(get_by_ids))
        .route("/api/:entity/update/:id", put(update_by_id))
        .route("/api/:entity/update-multiple", put(update_many))
        .route("/api/:entity/change-status", put(change_status))
        .route("/api/:entity/delete/:id", delete(delete_by_id))
        .route("/api/:entity/delete-multiple", post(delete_many))
        .route("/api/:entity/:id", get(get_by_id))
        .route("/views/category-tree", get(category_tree))
        .route("/views/child-categories/by-category", get(child_categories_by_category))
        .route("/views/child-categories/by-sub-category/:id", get(child_categories_by_sub_category))
        .route("/views/seo-pages/by-page/:page", get(seo_page_by_page))
        .route("/views/post-count", get(post_count))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Runs one entity operation, recording its outcome and latency.
async fn timed<T, F>(entity: &str, op: &'static str, fut: F) -> ApiResult<T>
where
    F: Future<Output = bazaar_core::Result<ResultEnvelope<T>>>,
{
    let started = Instant::now();
    let res = fut.await;
    metrics::record(entity, op, started, res.is_ok());
    Ok(Json(res?))
}

/// `name,slug` includes, `-image` excludes.
fn parse_select(raw: Option<&str>) -> Option<Projection> {
    let fields: Vec<(String, bool)> = raw?
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| match f.strip_prefix('-') {
            Some(excluded) => (excluded.to_string(), false),
            None => (f.to_string(), true),
        })
        .collect();
    (!fields.is_empty()).then_some(Projection(fields))
}

/// A missing or blank body means "everything, default order".
fn parse_query(body: &[u8]) -> Result<QueryRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(QueryRequest::default());
    }
    Ok(serde_json::from_slice(body).map_err(StateError::from)?)
}

fn parse_id(raw: &str) -> Result<ObjectId, ApiError> {
    Ok(ObjectId::parse_str(raw)?)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_text() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    let _ = encoder.encode(&prometheus::gather(), &mut buf);
    (StatusCode::OK, String::from_utf8(buf).unwrap_or_default())
}

async fn add(
    State(app): State<AppState>,
    Path(entity): Path<String>,
    JsonBody(doc): JsonBody<Document>,
) -> Result<(StatusCode, Json<ResultEnvelope<Created>>), ApiError> {
    let svc = app.catalog.service(&entity)?;
    let env = timed(&entity, "add", svc.add(doc)).await?;
    Ok((StatusCode::CREATED, env))
}

async fn insert_many(
    State(app): State<AppState>,
    Path(entity): Path<String>,
    Params(p): Params<ResetParams>,
    JsonBody(docs): JsonBody<Vec<Document>>,
) -> ApiResult<()> {
    let svc = app.catalog.service(&entity)?;
    timed(&entity, "insert_many", svc.insert_many(docs, p.delete_many)).await
}

async fn get_all(
    State(app): State<AppState>,
    Path(entity): Path<String>,
    Params(p): Params<SearchParams>,
    body: Bytes,
) -> ApiResult<Vec<Document>> {
    let svc = app.catalog.service(&entity)?;
    let req = parse_query(&body)?;
    timed(&entity, "get_all", svc.get_all(&req, p.q.as_deref())).await
}

async fn get_by_id(
    State(app): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    Params(p): Params<SelectParams>,
) -> ApiResult<Document> {
    let svc = app.catalog.service(&entity)?;
    let id = parse_id(&id)?;
    let select = parse_select(p.select.as_deref());
    timed(&entity, "get_by_id", svc.get_by_id(&id, select)).await
}

async fn get_by_slug(
    State(app): State<AppState>,
    Path((entity, slug)): Path<(String, String)>,
    Params(p): Params<SelectParams>,
) -> ApiResult<Document> {
    let svc = app.catalog.service(&entity)?;
    let select = parse_select(p.select.as_deref());
    timed(&entity, "get_by_slug", svc.get_by_slug(&slug, select)).await
}

async fn get_by_ids(
    State(app): State<AppState>,
    Path(entity): Path<String>,
    Params(p): Params<SelectParams>,
    JsonBody(body): JsonBody<IdsBody>,
) -> ApiResult<Vec<Document>> {
    let svc = app.catalog.service(&entity)?;
    let select = parse_select(p.select.as_deref());
    timed(&entity, "get_by_ids", svc.get_by_ids(&body.ids, select)).await
}

async fn update_by_id(
    State(app): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    JsonBody(patch): JsonBody<Document>,
) -> ApiResult<()> {
    let svc = app.catalog.service(&entity)?;
    let id = parse_id(&id)?;
    timed(&entity, "update", svc.update_by_id(&id, patch)).await
}

async fn update_many(
    State(app): State<AppState>,
    Path(entity): Path<String>,
    JsonBody(body): JsonBody<BulkPatch>,
) -> ApiResult<()> {
    let svc = app.catalog.service(&entity)?;
    timed(&entity, "update_many", svc.update_many(&body.ids, body.data)).await
}

async fn change_status(
    State(app): State<AppState>,
    Path(entity): Path<String>,
    JsonBody(body): JsonBody<StatusBody>,
) -> ApiResult<()> {
    let svc = app.catalog.service(&entity)?;
    timed(&entity, "change_status", svc.change_status(&body.ids, body.status)).await
}

async fn delete_by_id(
    State(app): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    Params(p): Params<UsageParams>,
) -> ApiResult<()> {
    let svc = app.catalog.service(&entity)?;
    let id = parse_id(&id)?;
    timed(&entity, "delete", svc.delete_by_id(&id, p.check_usage)).await
}

async fn delete_many(
    State(app): State<AppState>,
    Path(entity): Path<String>,
    Params(p): Params<UsageParams>,
    JsonBody(body): JsonBody<IdsBody>,
) -> ApiResult<BulkDeleteOutcome> {
    let svc = app.catalog.service(&entity)?;
    timed(&entity, "delete_many", svc.delete_many(&body.ids, p.check_usage)).await
}

async fn category_tree(State(app): State<AppState>) -> ApiResult<Vec<Document>> {
    timed("category", "tree", app.catalog.category_tree()).await
}

async fn child_categories_by_category(State(app): State<AppState>) -> ApiResult<Vec<Document>> {
    timed(
        "child-category",
        "group_by_category",
        app.catalog.child_categories_by_category(),
    )
    .await
}

async fn child_categories_by_sub_category(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Params(p): Params<SelectParams>,
) -> ApiResult<Vec<Document>> {
    let svc = app.catalog.service("child-category")?;
    let id = parse_id(&id)?;
    let select = parse_select(p.select.as_deref());
    let fut = svc.find_by_field("subCategory._id", id.to_value(), select);
    timed("child-category", "by_sub_category", fut).await
}

async fn seo_page_by_page(
    State(app): State<AppState>,
    Path(page): Path<String>,
    Params(p): Params<SelectParams>,
) -> ApiResult<Document> {
    let svc = app.catalog.service("seo-page")?;
    let select = parse_select(p.select.as_deref());
    let fut = svc.get_by_field("pageName", JsonValue::String(page), select);
    timed("seo-page", "by_page", fut).await
}

async fn post_count(State(app): State<AppState>) -> ApiResult<Document> {
    timed("product", "post_count", app.catalog.post_counts()).await
}

async fn admin_explain(
    State(app): State<AppState>,
    Path(entity): Path<String>,
    Params(p): Params<SearchParams>,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    let svc = app.catalog.service(&entity)?;
    let req = parse_query(&body)?;
    let t0 = Instant::now();
    let pipeline = svc.explain(&req, p.q.as_deref())?;
    metrics::QUERY_COMPILE_MICROS.observe(t0.elapsed().as_micros() as f64);
    Ok(Json(json!({
        "entity": entity,
        "collection": svc.schema().collection,
        "pipeline": pipeline,
    })))
}

async fn admin_snapshot(State(app): State<AppState>) -> ApiResult<JsonValue> {
    let Some(dir) = app.data_dir.clone() else {
        return Err(StateError::Invalid("no data dir configured".into()).into());
    };
    let manifest = persist::snapshot_now(app.catalog.store().clone(), dir).await?;
    Ok(Json(
        ResultEnvelope::ok("Snapshot written").with_data(json!(manifest)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use bazaar_catalog::SlugAllocator;
    use bazaar_storage::InMemoryStore;
    use tower::ServiceExt;

    async fn app() -> Router {
        let catalog = Catalog::marketplace(Arc::new(InMemoryStore::new()), SlugAllocator::default())
            .await
            .unwrap();
        router(AppState {
            catalog: Arc::new(catalog),
            data_dir: None,
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<JsonValue>) -> (StatusCode, JsonValue) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let req = match body {
            Some(b) => req.body(Body::from(b.to_string())),
            None => req.body(Body::empty()),
        }
        .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app().await;
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn crud_round() {
        let app = app().await;
        let (status, created) = call(&app, "POST", "/api/brand/add", Some(json!({"name": "Acme"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["data"]["_id"].as_str().unwrap().to_string();

        let (status, got) = call(&app, "GET", &format!("/api/brand/{id}?select=slug"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got["data"]["slug"], json!("acme"));
        assert!(got["data"].get("name").is_none());

        let (status, _) = call(&app, "PUT", &format!("/api/brand/update/{id}"), Some(json!({"name": "Acme Co"}))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, got) = call(&app, "GET", "/api/brand/get-by/acme-co", None).await;
        assert_eq!(got["data"]["name"], json!("Acme Co"));

        let (status, page) = call(
            &app,
            "POST",
            "/api/brand/get-all",
            Some(json!({"pagination": {"pageSize": 10, "currentPage": 0}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["count"], json!(1));

        let (status, _) = call(&app, "DELETE", &format!("/api/brand/delete/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, missing) = call(&app, "GET", &format!("/api/brand/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["success"], json!(false));
    }

    #[tokio::test]
    async fn errors_map_to_statuses() {
        let app = app().await;
        let (status, body) = call(&app, "POST", "/api/widgets/get-all", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], json!(false));

        let (status, _) = call(&app, "GET", "/api/brand/not-an-id", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "POST",
            "/api/brand/get-all",
            Some(json!({"filter": {"name": {"$where": "1"}}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, created) = call(
            &app,
            "POST",
            "/api/category/add",
            Some(json!({"name": "Uncategorized", "readOnly": true})),
        )
        .await;
        let id = created["data"]["_id"].as_str().unwrap().to_string();
        let (status, _) = call(&app, "DELETE", &format!("/api/category/delete/{id}?checkUsage=true"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn explain_renders_the_pipeline() {
        let app = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/admin/explain/brand?q=acme",
            Some(json!({"pagination": {"pageSize": 2, "currentPage": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["collection"], json!("brands"));
        assert!(body["pipeline"].as_array().is_some_and(|s| !s.is_empty()));
    }

    #[tokio::test]
    async fn lookup_routes() {
        let app = app().await;
        let mut ids = Vec::new();
        for name in ["Atlas", "Vinyl"] {
            let (_, created) = call(&app, "POST", "/api/product/add", Some(json!({"name": name, "postType": "products"}))).await;
            ids.push(created["data"]["_id"].clone());
        }
        let (status, body) = call(&app, "POST", "/api/product/get-by-ids?select=name", Some(json!({"ids": ids}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], json!(2));

        let (status, body) = call(&app, "GET", "/views/post-count", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["products"], json!(2));

        call(&app, "POST", "/api/seo-page/add", Some(json!({"name": "Home", "pageName": "home"}))).await;
        let (status, body) = call(&app, "GET", "/views/seo-pages/by-page/home", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], json!("Home"));
        let (status, _) = call(&app, "GET", "/views/seo-pages/by-page/about", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "GET", "/views/category-tree", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
        let (status, _) = call(&app, "GET", "/views/child-categories/by-sub-category/nope", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn snapshot_needs_a_data_dir() {
        let app = app().await;
        let (status, _) = call(&app, "POST", "/admin/snapshot", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn select_parsing() {
        assert_eq!(parse_select(None), None);
        assert_eq!(parse_select(Some(" , ")), None);
        assert_eq!(
            parse_select(Some("name, -image")),
            Some(Projection(vec![("name".into(), true), ("image".into(), false)]))
        );
    }
}
