//! OpenAI API data models for the proxy surface.
//!
//! Domain types live in `clara-core` and `clara-runtime`; this module
//! handles the API layer mapping.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use clara_core::ProxyError;
use clara_runtime::{ModelStatus, ProcessState};

/// Response to `GET /v1/models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

/// One entry in the model listing, OpenAI shape plus the live state.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
    /// Current lifecycle state of the backing subprocess.
    pub state: ProcessState,
}

impl ModelsResponse {
    #[must_use]
    pub fn from_statuses(statuses: Vec<ModelStatus>) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            object: "list",
            data: statuses
                .into_iter()
                .map(|status| ModelEntry {
                    id: status.id,
                    object: "model",
                    created,
                    owned_by: "claracore",
                    state: status.state,
                })
                .collect(),
        }
    }
}

/// OpenAI-style error envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub r#type: String,
}

impl ErrorResponse {
    #[must_use]
    pub fn new(message: impl Into<String>, error_type: &str) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                r#type: error_type.to_string(),
            },
        }
    }

    #[must_use]
    pub fn upstream_error(message: &str) -> Self {
        Self::new(message, "upstream_error")
    }
}

impl From<&ProxyError> for ErrorResponse {
    fn from(err: &ProxyError) -> Self {
        let error_type = match err {
            ProxyError::NotFound(_) => "not_found",
            ProxyError::Unavailable { .. } | ProxyError::Gone(_) => "unavailable",
            ProxyError::Conflict => "conflict",
            ProxyError::TooManyRequests(_) => "rate_limited",
            ProxyError::Upstream(_) => "upstream_error",
            ProxyError::Cancelled => "cancelled",
        };
        Self::new(err.to_string(), error_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_serializes_openai_shape() {
        let response = ModelsResponse::from_statuses(vec![ModelStatus {
            id: "llama-8b".to_string(),
            state: ProcessState::Ready,
            group: "heavy".to_string(),
        }]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], "llama-8b");
        assert_eq!(json["data"][0]["object"], "model");
        assert_eq!(json["data"][0]["state"], "ready");
    }

    #[test]
    fn error_envelope_carries_type() {
        let err = ProxyError::NotFound("ghost".to_string());
        let body = ErrorResponse::from(&err);
        assert_eq!(body.error.r#type, "not_found");
        assert!(body.error.message.contains("ghost"));
    }
}
