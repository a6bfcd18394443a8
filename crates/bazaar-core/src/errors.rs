use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("projection mismatch: {0}")]
    ProjectionMismatch(String),
    #[error("no data found: {0}")]
    NotFound(String),
    #[error("read only data can not be modified: {0}")]
    Protected(String),
    #[error("{field} must be unique in {collection}: {value}")]
    UniqueViolation {
        collection: String,
        field: String,
        value: String,
    },
    #[error("could not allocate a unique slug for '{base}' after {attempts} attempts")]
    AllocationExhausted { base: String, attempts: u32 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("no read only fallback entity in {0}")]
    MissingFallback(String),
    #[error("storage fault: {0}")]
    Storage(String),
}

/// Boundary classification of a [`StateError`], one per external status class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Protected,
    Conflict,
    Storage,
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::Invalid(_) | StateError::ProjectionMismatch(_) => ErrorKind::Validation,
            StateError::NotFound(_) => ErrorKind::NotFound,
            StateError::Protected(_) => ErrorKind::Protected,
            StateError::UniqueViolation { .. }
            | StateError::AllocationExhausted { .. }
            | StateError::Conflict(_) => ErrorKind::Conflict,
            // a missing fallback row is a seeding fault, not a caller defect
            StateError::MissingFallback(_) | StateError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn is_unique_violation_on(&self, name: &str) -> bool {
        matches!(self, StateError::UniqueViolation { field, .. } if field == name)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Invalid(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_every_variant() {
        assert_eq!(
            StateError::ProjectionMismatch("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            StateError::AllocationExhausted {
                base: "books".into(),
                attempts: 3
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            StateError::MissingFallback("brands".into()).kind(),
            ErrorKind::Storage
        );
        assert_eq!(StateError::Protected("x".into()).kind(), ErrorKind::Protected);
    }

    #[test]
    fn unique_violation_names_its_field() {
        let err = StateError::UniqueViolation {
            collection: "categories".into(),
            field: "slug".into(),
            value: "books".into(),
        };
        assert!(err.is_unique_violation_on("slug"));
        assert!(!err.is_unique_violation_on("name"));
        assert_eq!(err.to_string(), "slug must be unique in categories: books");
    }
}
