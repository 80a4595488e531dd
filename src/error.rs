//! Error types for the assist pipeline

use thiserror::Error;

/// Result type alias for the assist pipeline
pub type Result<T> = std::result::Result<T, AssistError>;

/// Main error type for the assist pipeline
#[derive(Debug, Error)]
pub enum AssistError {
    /// Admission control rejected the request
    #[error("{message}")]
    RateLimited { message: String },

    /// A required request field was missing or empty
    #[error("{field} is required.")]
    Validation { field: String },

    /// The request body was not valid JSON for the route
    #[error("Invalid request body: {message}")]
    InvalidBody { message: String },

    /// The prompt store has no prompt with this name
    #[error("Prompt not found: {name}")]
    PromptNotFound { name: String },

    /// The prompt store could not be reached or returned garbage
    #[error("Prompt store error: {message}")]
    PromptStore { message: String },

    /// Tool gateway session failure (open, discovery, close)
    #[error("Tool gateway error: {message}")]
    ToolGateway { message: String },

    /// Error from the OpenAI API
    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] async_openai::error::OpenAIError),

    /// Model behavior error (empty output, unparsable structured output)
    #[error("Model behavior error: {message}")]
    ModelBehaviorError { message: String },

    /// The handler exceeded its wall-clock budget
    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// A feature was requested whose credentials are not configured
    #[error("{message}")]
    NotConfigured { message: String },

    /// Telemetry export failure; never surfaced to callers
    #[error("Telemetry error: {message}")]
    Telemetry { message: String },

    /// Outbound HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl AssistError {
    pub fn validation(field: impl Into<String>) -> Self {
        AssistError::Validation {
            field: field.into(),
        }
    }

    /// HTTP status code this error maps to at the handler boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            AssistError::RateLimited { .. } => 429,
            AssistError::Validation { .. } | AssistError::InvalidBody { .. } => 400,
            AssistError::NotConfigured { .. } => 503,
            AssistError::Timeout { .. } => 504,
            _ => 500,
        }
    }
}

impl From<tower::BoxError> for AssistError {
    fn from(err: tower::BoxError) -> Self {
        match err.downcast::<AssistError>() {
            Ok(inner) => *inner,
            Err(other) => AssistError::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AssistError::validation("Text");
        assert_eq!(err.to_string(), "Text is required.");

        let err = AssistError::PromptNotFound {
            name: "missing-chat".to_string(),
        };
        assert_eq!(err.to_string(), "Prompt not found: missing-chat");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AssistError::RateLimited {
                message: "Rate limit exceeded.".into()
            }
            .status_code(),
            429
        );
        assert_eq!(AssistError::validation("Prompt").status_code(), 400);
        assert_eq!(
            AssistError::NotConfigured {
                message: "missing".into()
            }
            .status_code(),
            503
        );
        assert_eq!(AssistError::Other("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_error_from_openai() {
        let openai_err = async_openai::error::OpenAIError::InvalidArgument("test".to_string());
        let err: AssistError = openai_err.into();
        assert!(matches!(err, AssistError::OpenAIError(_)));
    }

    #[test]
    fn test_box_error_roundtrip_keeps_variant() {
        let boxed: tower::BoxError = Box::new(AssistError::ToolGateway {
            message: "closed".into(),
        });
        let err: AssistError = boxed.into();
        assert!(matches!(err, AssistError::ToolGateway { .. }));

        let boxed: tower::BoxError = "plain".into();
        let err: AssistError = boxed.into();
        assert!(matches!(err, AssistError::Other(ref m) if m == "plain"));
    }
}
