//! Error types for leadflow.
//!
//! Every variant carries a stable machine code so API clients and operators
//! can act on failures without parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::GraphValidationError;

/// Result type alias for leadflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// leadflow error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Definition-time structural problems. Carries every violation found.
    #[error("{0}")]
    GraphValidation(#[from] GraphValidationError),

    /// The pinned definition no longer matches what a live execution expects.
    #[error("Graph integrity error: {0}")]
    GraphIntegrity(String),

    #[error("Node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic write lost against a concurrent writer.
    #[error("Concurrent update on execution ({workflow_id}, {lead_id})")]
    ConcurrentUpdate {
        workflow_id: String,
        lead_id: String,
    },

    #[error("Email error: {0}")]
    Email(String),

    /// The provider refused the message; resending it unchanged will not help.
    #[error("Email rejected: {0}")]
    EmailRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::GraphValidation(_) => "GRAPH_VALIDATION_ERROR",
            Error::GraphIntegrity(_) => "GRAPH_INTEGRITY_ERROR",
            Error::NodeExecution { .. } => "NODE_EXECUTION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::ConcurrentUpdate { .. } => "CONCURRENT_UPDATE",
            Error::Email(_) => "EMAIL_ERROR",
            Error::EmailRejected(_) => "EMAIL_REJECTED",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Error category for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::GraphValidation(_)
            | Error::NotFound(_)
            | Error::Parse(_)
            | Error::Yaml(_)
            | Error::Json(_) => ErrorCategory::ClientError,
            Error::ConcurrentUpdate { .. } => ErrorCategory::Conflict,
            Error::Http(_) | Error::Email(_) => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }

    /// HTTP status code mapping.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::GraphValidation(_) => 422,
            Error::NotFound(_) => 404,
            Error::ConcurrentUpdate { .. } => 409,
            Error::Parse(_) | Error::Yaml(_) | Error::Json(_) => 400,
            _ => 500,
        }
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Hides file paths, SQL statements and transport details.
    pub fn external_message(&self) -> String {
        match self {
            Error::GraphValidation(e) => e.to_string(),
            Error::GraphIntegrity(msg) => format!("Graph integrity error: {}", msg),
            Error::NodeExecution { node_id, message } => {
                format!("Node '{}' failed: {}", node_id, message)
            }
            Error::NotFound(msg) => format!("Not found: {}", msg),
            Error::ConcurrentUpdate { .. } => "Execution was updated concurrently".to_string(),
            Error::Config(msg) => format!("Configuration error: {}", msg),
            Error::Parse(msg) => format!("Parse error: {}", msg),

            Error::Email(_) => "Email delivery failed".to_string(),
            Error::EmailRejected(_) => "Email was rejected by the provider".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),

            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("HTTP request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "HTTP request timed out".to_string()
                } else {
                    "HTTP request failed".to_string()
                }
            }

            Error::Yaml(_) => "Invalid YAML format".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),
        }
    }

    /// Convert to a JSON error body with the sanitized message.
    pub fn to_external_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": {
                "code": self.code(),
                "category": self.category(),
                "message": self.external_message(),
            }
        });
        if let Error::GraphValidation(e) = self {
            body["error"]["violations"] = serde_json::json!(e.violations);
        }
        body
    }
}

/// Error categories used by API clients for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid request or missing entity. Do not retry without changes.
    ClientError,
    /// May succeed on retry.
    Transient,
    /// Unlikely to succeed on retry.
    Permanent,
    /// Another writer won; the current state stands.
    Conflict,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::ClientError => write!(f, "client_error"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Conflict => write!(f, "conflict"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Violation;

    #[test]
    fn test_not_found_maps_to_404() {
        let err = Error::NotFound("workflow 'wf-1'".into());
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.http_status(), 404);
        assert_eq!(err.category(), ErrorCategory::ClientError);
    }

    #[test]
    fn test_validation_error_json_lists_violations() {
        let err = Error::from(GraphValidationError {
            violations: vec![
                Violation::MissingTrigger,
                Violation::DelayWithoutOutgoing {
                    node_id: "d1".into(),
                },
            ],
        });
        let body = err.to_external_json();
        assert_eq!(body["error"]["code"], "GRAPH_VALIDATION_ERROR");
        assert_eq!(body["error"]["violations"].as_array().unwrap().len(), 2);
        assert_eq!(err.http_status(), 422);
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err = Error::Internal("/var/lib/leadflow/db.sqlite locked".into());
        assert!(!err.external_message().contains("/var/lib"));
    }

    #[test]
    fn test_rejected_email_is_permanent() {
        let err = Error::EmailRejected("422: invalid `to` field".into());
        assert_eq!(err.code(), "EMAIL_REJECTED");
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!err.external_message().contains("invalid"));
        assert_eq!(Error::Email("timeout".into()).category(), ErrorCategory::Transient);
    }
}
