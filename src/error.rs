// Error taxonomy for the tool-execution service.
//
// Two layers:
// - `ErrorKind` is the closed, numeric taxonomy tools and the dispatcher use
//   at the envelope boundary. It is "input" or "execution" class by numeric
//   range.
// - `ToolError` pairs a kind with a message and optional data — the
//   "distinguished business error" tool bodies raise; the stateless harness
//   and the dispatcher convert it directly into an error envelope.
// - `ServiceError` covers internal plumbing failures (IO, join errors, …)
//   that aren't part of the tool-facing taxonomy; it converts into
//   `ToolError` at the boundary via `ErrorKind::UnexpectedError`.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// The closed set of numeric error kinds, with stable numeric codes so
/// clients can match on them without caring about wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u32")]
pub enum ErrorKind {
    InvalidInput,
    BusinessFailure,
    InvalidRequestFormat,
    MissingRequiredField,
    InvalidParameterType,
    InvalidUrlFormat,
    NoResultsFound,
    ResourceNotInitialized,

    ExecutionError,
    ApiKeyNotConfigured,
    ApiRequestFailed,
    ApiResponseParseError,
    UnexpectedError,
    TimeoutError,
    CrawlingError,
    SummarizationError,
    AllRequestsFailed,
    PartialFailure,
    BackendNotInitialized,
    DependencyFailure,
    InternalError,
}

impl ErrorKind {
    /// The numeric code returned on the wire.
    pub const fn code(self) -> u32 {
        match self {
            ErrorKind::InvalidInput => 4000,
            ErrorKind::BusinessFailure => 4001,
            ErrorKind::InvalidRequestFormat => 4002,
            ErrorKind::MissingRequiredField => 4003,
            ErrorKind::InvalidParameterType => 4004,
            ErrorKind::InvalidUrlFormat => 4005,
            ErrorKind::NoResultsFound => 4006,
            ErrorKind::ResourceNotInitialized => 4007,

            ErrorKind::ExecutionError => 5000,
            ErrorKind::ApiKeyNotConfigured => 5002,
            ErrorKind::ApiRequestFailed => 5003,
            ErrorKind::ApiResponseParseError => 5004,
            ErrorKind::UnexpectedError => 5005,
            ErrorKind::TimeoutError => 5006,
            ErrorKind::CrawlingError => 5007,
            ErrorKind::SummarizationError => 5008,
            ErrorKind::AllRequestsFailed => 5009,
            ErrorKind::PartialFailure => 5010,
            ErrorKind::BackendNotInitialized => 5011,
            ErrorKind::DependencyFailure => 5012,
            ErrorKind::InternalError => 5013,
        }
    }

    /// Input (4xxx) vs execution (5xxx) class.
    pub const fn is_input_class(self) -> bool {
        self.code() < 5000
    }

    /// Default human-readable message for this kind, used when a tool
    /// raises a kind without a custom message.
    pub const fn default_message(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid input provided",
            ErrorKind::BusinessFailure => "business logic execution failed",
            ErrorKind::InvalidRequestFormat => "invalid request format",
            ErrorKind::MissingRequiredField => "missing required field",
            ErrorKind::InvalidParameterType => "invalid parameter type",
            ErrorKind::InvalidUrlFormat => "invalid URL format",
            ErrorKind::NoResultsFound => "no results found",
            ErrorKind::ResourceNotInitialized => "resource not initialized",

            ErrorKind::ExecutionError => "tool execution failed",
            ErrorKind::ApiKeyNotConfigured => "API key not configured",
            ErrorKind::ApiRequestFailed => "API request failed",
            ErrorKind::ApiResponseParseError => "failed to parse API response",
            ErrorKind::UnexpectedError => "unexpected error occurred",
            ErrorKind::TimeoutError => "request timeout",
            ErrorKind::CrawlingError => "crawling error",
            ErrorKind::SummarizationError => "summarization error",
            ErrorKind::AllRequestsFailed => "all requests failed",
            ErrorKind::PartialFailure => "partial failure",
            ErrorKind::BackendNotInitialized => "backend not initialized",
            ErrorKind::DependencyFailure => "external dependency failed",
            ErrorKind::InternalError => "internal system error",
        }
    }
}

impl From<ErrorKind> for u32 {
    fn from(k: ErrorKind) -> u32 {
        k.code()
    }
}

/// The "business error" tool bodies raise. The stateless harness and the
/// dispatcher convert this directly into an error envelope — never a
/// panic, never a generic exception path.
#[derive(Debug, Error)]
#[error("{kind_message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    kind_message: String,
    pub data: Option<Value>,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            kind_message: message.into(),
            data: None,
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn message(&self) -> &str {
        &self.kind_message
    }
}

/// Internal plumbing failures that are not part of the tool-facing
/// taxonomy. These occur inside backends, the session router, and the
/// config loader; the harness converts any of them into an
/// `ErrorKind::UnexpectedError` / `ErrorKind::InternalError` tool error at
/// the boundary (see `dispatch::dispatcher`).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Tool(#[from] ToolError),

    #[error("{0}")]
    Other(String),
}

impl From<String> for ServiceError {
    fn from(s: String) -> Self {
        ServiceError::Other(s)
    }
}

impl From<ServiceError> for ToolError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Tool(e) => e,
            other => ToolError::new(ErrorKind::UnexpectedError, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
