use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bazaar_core::{ErrorKind, ResultEnvelope, StateError};

/// Boundary wrapper turning a [`StateError`] into a failure envelope.
#[derive(Debug)]
pub struct ApiError(pub StateError);

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(r: JsonRejection) -> Self {
        Self(StateError::Invalid(r.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(r: QueryRejection) -> Self {
        Self(StateError::Invalid(r.body_text()))
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Protected => StatusCode::FORBIDDEN,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if kind == ErrorKind::Storage {
            tracing::error!(error = %self.0, "request failed");
        }
        (status_for(kind), Json(ResultEnvelope::failure(&self.0))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_status() {
        let cases = [
            (StateError::Invalid("x".into()), StatusCode::BAD_REQUEST),
            (StateError::ProjectionMismatch("x".into()), StatusCode::BAD_REQUEST),
            (StateError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (StateError::Protected("x".into()), StatusCode::FORBIDDEN),
            (
                StateError::AllocationExhausted {
                    base: "x".into(),
                    attempts: 1,
                },
                StatusCode::CONFLICT,
            ),
            (StateError::MissingFallback("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
