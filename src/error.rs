//! Error types for query compilation, registry construction and document rendering.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error raised by a record provider.
pub type ProviderFailure = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced to a JSON:API client.
///
/// Every variant maps to an HTTP status and a title; the rendered
/// [`ErrorObject`] never carries internal diagnostics for server-side kinds.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid query: {detail}")]
    InvalidQuery { detail: String },

    #[error("unauthorized: {detail}")]
    Unauthorized { detail: String },

    #[error("not found: {detail}")]
    NotFound { detail: String },

    #[error("conflict: {detail}")]
    Conflict { detail: String },

    /// Broken invariant or unclassified provider failure, reported to
    /// clients as a generic 500.
    #[error("internal consistency: {detail}")]
    InternalConsistency {
        detail: String,
        #[source]
        source: Option<ProviderFailure>,
    },

    #[error("request timed out after {millis} ms")]
    Timeout { millis: u64 },
}

impl ApiError {
    pub fn invalid_query(detail: impl Into<String>) -> Self {
        ApiError::InvalidQuery {
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        ApiError::NotFound {
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        ApiError::InternalConsistency {
            detail: detail.into(),
            source: None,
        }
    }

    /// Wrap an arbitrary provider error as `InternalConsistency`.
    pub fn provider(source: impl Into<ProviderFailure>) -> Self {
        let source = source.into();
        ApiError::InternalConsistency {
            detail: format!("provider failure: {}", source),
            source: Some(source),
        }
    }

    /// HTTP status code for this error kind.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::InvalidQuery { .. } => 400,
            ApiError::Unauthorized { .. } => 401,
            ApiError::NotFound { .. } => 404,
            ApiError::Conflict { .. } => 409,
            ApiError::InternalConsistency { .. } => 500,
            ApiError::Timeout { .. } => 504,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ApiError::InvalidQuery { .. } => "Invalid query parameter",
            ApiError::Unauthorized { .. } => "Unauthorized",
            ApiError::NotFound { .. } => "Resource not found",
            ApiError::Conflict { .. } => "Resource already exists",
            ApiError::InternalConsistency { .. } => "Internal server error",
            ApiError::Timeout { .. } => "Request timed out",
        }
    }

    /// True for 5xx kinds.
    pub fn is_server_error(&self) -> bool {
        self.status() >= 500
    }

    /// Render as a JSON:API error object.
    ///
    /// Server-side kinds get a fixed detail so provider internals do not leak.
    pub fn to_error_object(&self) -> ErrorObject {
        let detail = match self {
            ApiError::InvalidQuery { detail }
            | ApiError::Unauthorized { detail }
            | ApiError::NotFound { detail }
            | ApiError::Conflict { detail } => Some(detail.clone()),
            ApiError::Timeout { .. } => Some(self.to_string()),
            ApiError::InternalConsistency { .. } => Some("Internal server error".to_string()),
        };
        ErrorObject {
            status: self.status(),
            title: Some(self.title().to_string()),
            detail,
        }
    }

    /// Returns the exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        if self.is_server_error() {
            2
        } else {
            1
        }
    }
}

/// Single JSON:API error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(title) = &self.title {
            write!(f, " {}", title)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Errors while building the resource registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("resource type '{type_name}' registered twice")]
    DuplicateType { type_name: String },

    #[error("relationship '{owner}.{relationship}' targets unregistered type '{target}'")]
    UnknownTarget {
        owner: String,
        relationship: String,
        target: String,
    },

    #[error("relationship '{owner}.{relationship}' must set exactly one of mapping_field or condition")]
    InvalidFetchMode { owner: String, relationship: String },

    #[error("relationship '{owner}.{relationship}' maps unknown attribute '{field}'")]
    UnknownMappingField {
        owner: String,
        relationship: String,
        field: String,
    },

    #[error("invalid parent '{relationship}' on '{owner}': {message}")]
    InvalidParent {
        owner: String,
        relationship: String,
        message: String,
    },

    #[error("invalid declaration: {message}")]
    InvalidDeclaration { message: String },
}

/// Errors while loading registry or record files.
#[derive(Debug, Error)]
pub enum LoadError {
    // IO errors (exit code 3)
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("cannot read {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[cfg(feature = "remote")]
    #[error("failed to fetch {url}: {source}")]
    NetworkError {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    // Parse errors (exit code 2)
    #[error("invalid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid records: {message}")]
    InvalidRecords { message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RegistryError {
    /// Returns the exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

impl LoadError {
    /// Returns the exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoadError::FileNotFound { .. } | LoadError::ReadError { .. } => 3,
            #[cfg(feature = "remote")]
            LoadError::NetworkError { .. } => 3,
            _ => 2,
        }
    }
}
