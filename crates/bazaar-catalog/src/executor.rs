use bazaar_core::{
    Document, ErrorKind, Pipeline, Result, ResultEnvelope, StateError, COUNT_FIELD, DATA_FIELD,
};
use bazaar_storage::Storage;
use serde_json::Value as JsonValue;

/// Runs a compiled pipeline and wraps the outcome. Paginated pipelines yield
/// one `{data, count}` document whose count is the pre-pagination total.
pub async fn execute(
    store: &dyn Storage,
    collection: &str,
    pipeline: &Pipeline,
) -> Result<ResultEnvelope<Vec<Document>>> {
    tracing::debug!(collection, pipeline = %pipeline.to_json(), "execute");
    let mut out = store
        .aggregate(collection, pipeline)
        .await
        .inspect_err(|e| {
            if e.kind() == ErrorKind::Storage {
                tracing::error!(collection, error = %e, "aggregation failed");
            }
        })?;

    if !pipeline.is_paginated() {
        let count = out.len() as u64;
        return Ok(ResultEnvelope::ok("Success").with_data(out).with_count(count));
    }

    let Some(mut page) = out.pop() else {
        return Ok(ResultEnvelope::ok("Success").with_data(Vec::new()).with_count(0));
    };
    let data = match page.remove(DATA_FIELD) {
        Some(JsonValue::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                JsonValue::Object(m) => Ok(m),
                other => Err(StateError::Storage(format!("malformed page entry: {other}"))),
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
        Some(other) => {
            return Err(StateError::Storage(format!("malformed page: {other}")));
        }
    };
    // an empty match leaves no count behind
    let count = page.get(COUNT_FIELD).and_then(JsonValue::as_u64).unwrap_or(0);
    Ok(ResultEnvelope::ok("Success").with_data(data).with_count(count))
}
