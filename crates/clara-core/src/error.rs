//! Error types surfaced by the claracore runtime.

use thiserror::Error;

/// Errors that can occur while admitting or forwarding a request.
///
/// Each variant corresponds to one externally observable failure mode and
/// carries a suggested HTTP status for the proxy layer.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The requested model id is not present in the configuration.
    #[error("unknown model: {0}")]
    NotFound(String),

    /// The subprocess could not be brought to a ready state in time.
    #[error("model {model} is unavailable: {reason}")]
    Unavailable { model: String, reason: String },

    /// Timed out waiting for an exclusive peer group to drain.
    #[error("timed out waiting for exclusive group to release resources")]
    Conflict,

    /// The model's concurrency limit is saturated and the caller declined
    /// to queue.
    #[error("model {0} is at its concurrency limit")]
    TooManyRequests(String),

    /// The subprocess returned a malformed response or the connection
    /// dropped mid-stream.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The inbound request was cancelled by the client.
    #[error("request cancelled by client")]
    Cancelled,

    /// The process has been shut down and accepts no further operations.
    #[error("model {0} has been shut down")]
    Gone(String),
}

impl ProxyError {
    /// Suggested HTTP status code for this error.
    ///
    /// `Upstream` maps to 502 only when response headers have not been
    /// sent yet; mid-stream failures truncate the response instead.
    #[must_use]
    pub const fn suggested_status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Unavailable { .. } | Self::Conflict | Self::Gone(_) => 503,
            Self::TooManyRequests(_) => 429,
            Self::Upstream(_) => 502,
            Self::Cancelled => 499,
        }
    }

    /// Returns true if this error indicates a temporary condition where
    /// retrying may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Conflict | Self::TooManyRequests(_)
        )
    }
}

/// Errors raised while loading or validating a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A macro expands to itself, directly or through other macros.
    #[error("macro cycle detected: {0}")]
    MacroCycle(String),

    /// A template references a macro that is not defined.
    #[error("unknown macro ${{{name}}} in {context}")]
    UnknownMacro { name: String, context: String },

    #[error("model {model}: {reason}")]
    InvalidModel { model: String, reason: String },

    #[error("group {group}: {reason}")]
    InvalidGroup { group: String, reason: String },

    /// A model id appears in more than one group.
    #[error("model {model} is a member of both {first} and {second}")]
    DuplicateMembership {
        model: String,
        first: String,
        second: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_table() {
        assert_eq!(
            ProxyError::NotFound("x".into()).suggested_status_code(),
            404
        );
        assert_eq!(
            ProxyError::Unavailable {
                model: "x".into(),
                reason: "timeout".into()
            }
            .suggested_status_code(),
            503
        );
        assert_eq!(ProxyError::Conflict.suggested_status_code(), 503);
        assert_eq!(
            ProxyError::TooManyRequests("x".into()).suggested_status_code(),
            429
        );
        assert_eq!(
            ProxyError::Upstream("eof".into()).suggested_status_code(),
            502
        );
        assert_eq!(ProxyError::Gone("x".into()).suggested_status_code(), 503);
    }

    #[test]
    fn retryable_classification() {
        assert!(ProxyError::Conflict.is_retryable());
        assert!(ProxyError::TooManyRequests("x".into()).is_retryable());
        assert!(!ProxyError::NotFound("x".into()).is_retryable());
        assert!(!ProxyError::Gone("x".into()).is_retryable());
    }
}
