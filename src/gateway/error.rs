//! Error types for the completion gateway.

use std::time::Duration;
use thiserror::Error;

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from provider (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors that can occur when calling the completion provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The hard deadline fired before the provider answered.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the in-flight request.
    #[error("request cancelled")]
    Cancelled,

    /// Provider rejected the call with a non-success HTTP status.
    #[error("provider returned HTTP {status}: {message}")]
    Api {
        status: u16,
        message: String,
        /// The provider's error envelope, or the raw body when it was not JSON.
        payload: serde_json::Value,
        context: ErrorContext,
    },

    /// Success status, but the body did not carry generated text.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Request rejected locally before it was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing API key, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn api(
        status: u16,
        message: impl Into<String>,
        payload: serde_json::Value,
        context: ErrorContext,
    ) -> Self {
        Self::Api {
            status,
            message: message.into(),
            payload,
            context,
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether re-invoking the same call may succeed.
    ///
    /// The gateway itself never retries; this only informs the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Cancelled => true,
            Self::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::InvalidResponse(_) => true,
            Self::InvalidRequest(_) => false,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Config(_) => false,
        }
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Api { status: 429, .. } => "rate_limited",
            Self::Api { .. } => "api_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Api { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Get the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}
