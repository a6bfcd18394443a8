use crate::StateError;
use serde::{Deserialize, Serialize};

/// Uniform wrapper returned by every public operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope<T> {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl<T> ResultEnvelope<T> {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            count: None,
        }
    }

    pub fn with_data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }
}

impl ResultEnvelope<()> {
    /// Failure envelopes never carry data.
    pub fn failure(err: &StateError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: None,
            count: None,
        }
    }
}
