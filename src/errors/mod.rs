// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP-facing errors.
//!
//! [`UserError`] is what API clients see: a stable `error_type`, a short
//! message and a reference code that also appears in the server log next to
//! the full internal details. Engine messages are scrubbed of secrets,
//! addresses and absolute paths before they reach either.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::error::HarvestError;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

// =============================================================================
// USER-FACING ERROR TYPES
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum UserError {
    /// Malformed or unacceptable request (400)
    InvalidRequest {
        message: String,
        reference: String,
        field: Option<String>,
    },

    /// Path outside the download root (403)
    AccessDenied {
        message: String,
        reference: String,
    },

    /// Unknown download, extraction or path (404)
    NotFound {
        message: String,
        reference: String,
    },

    /// Request conflicts with current state (409)
    Conflict {
        message: String,
        reference: String,
        current_status: Option<String>,
    },

    /// Unexpected failure (500); never carries internal details
    InternalError {
        message: String,
        reference: String,
    },

    /// Engine refused or garbled the call (502)
    BadGateway {
        message: String,
        reference: String,
    },

    /// Engine temporarily unreachable (503)
    ServiceUnavailable {
        message: String,
        reference: String,
        retry_after_secs: Option<u64>,
    },
}

impl UserError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UserError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            UserError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            UserError::NotFound { .. } => StatusCode::NOT_FOUND,
            UserError::Conflict { .. } => StatusCode::CONFLICT,
            UserError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UserError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            UserError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the reference code for this error.
    pub fn reference(&self) -> &str {
        match self {
            UserError::InvalidRequest { reference, .. } => reference,
            UserError::AccessDenied { reference, .. } => reference,
            UserError::NotFound { reference, .. } => reference,
            UserError::Conflict { reference, .. } => reference,
            UserError::InternalError { reference, .. } => reference,
            UserError::BadGateway { reference, .. } => reference,
            UserError::ServiceUnavailable { reference, .. } => reference,
        }
    }

    /// Get the user-facing message.
    pub fn message(&self) -> &str {
        match self {
            UserError::InvalidRequest { message, .. } => message,
            UserError::AccessDenied { message, .. } => message,
            UserError::NotFound { message, .. } => message,
            UserError::Conflict { message, .. } => message,
            UserError::InternalError { message, .. } => message,
            UserError::BadGateway { message, .. } => message,
            UserError::ServiceUnavailable { message, .. } => message,
        }
    }
}

/// User-facing error response structure (JSON format).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: UserError,
    pub status: u16,
}

impl IntoResponse for UserError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}

// =============================================================================
// ERROR CONSTRUCTORS (WITH LOGGING)
// =============================================================================

impl UserError {
    pub fn invalid_request(user_message: &str, field: Option<&str>) -> Self {
        let reference = generate_reference_code();
        tracing::debug!(reference = %reference, field = ?field, "Invalid request: {}", user_message);

        Self::InvalidRequest {
            message: user_message.to_string(),
            reference,
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn access_denied(internal_reason: &str) -> Self {
        let reference = generate_reference_code();
        tracing::warn!(
            reference = %reference,
            internal_reason = %sanitize_error_details(internal_reason),
            "Path outside download root rejected"
        );

        Self::AccessDenied {
            message: "Access denied: path is outside the download directory.".to_string(),
            reference,
        }
    }

    pub fn permission_denied(internal_reason: &str) -> Self {
        let reference = generate_reference_code();
        tracing::warn!(
            reference = %reference,
            internal_reason = %sanitize_error_details(internal_reason),
            "Filesystem permission denied"
        );

        Self::AccessDenied {
            message: "Access denied: insufficient permissions for this path.".to_string(),
            reference,
        }
    }

    pub fn not_found(user_message: &str) -> Self {
        Self::NotFound {
            message: user_message.to_string(),
            reference: generate_reference_code(),
        }
    }

    pub fn conflict(user_message: &str, current_status: Option<String>) -> Self {
        let reference = generate_reference_code();
        tracing::debug!(reference = %reference, "Conflict: {}", user_message);

        Self::Conflict {
            message: user_message.to_string(),
            reference,
            current_status,
        }
    }

    /// Create an InternalError, logging full details internally.
    pub fn internal_error(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(
            reference = %reference,
            internal_error = %sanitize_error_details(internal_error),
            "Internal error"
        );

        Self::InternalError {
            message: "An unexpected error occurred. Please try again or contact support with the reference code.".to_string(),
            reference,
        }
    }

    pub fn bad_gateway(user_message: &str, internal_details: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(
            reference = %reference,
            internal_details = %sanitize_error_details(internal_details),
            "Engine call failed"
        );

        Self::BadGateway {
            message: user_message.to_string(),
            reference,
        }
    }

    pub fn service_unavailable(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        tracing::warn!(
            reference = %reference,
            internal_error = %sanitize_error_details(internal_error),
            "Engine unavailable"
        );

        Self::ServiceUnavailable {
            message: "The download engine is temporarily unavailable. Please try again shortly.".to_string(),
            reference,
            retry_after_secs: Some(5),
        }
    }
}

// =============================================================================
// SANITIZATION
// =============================================================================

static SANITIZE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // RPC secrets and bearer tokens
        (Regex::new(r"token:[^\s,\]\x22]+").expect("RPC token regex"), "token:[REDACTED]"),
        (Regex::new(r"Bearer [a-zA-Z0-9-._~+/]+=*").expect("Bearer token regex"), "Bearer [TOKEN_REDACTED]"),
        (Regex::new(r"(?i)(?:rpc-secret|secret)=[^\s&;]+").expect("Secret param regex"), "secret=[REDACTED]"),

        // Absolute paths
        (Regex::new(r"[A-Za-z]:\\[^\s]+").expect("Windows path regex"), "[PATH_REDACTED]"),
        (Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root|srv|mnt|data)/[^\s]*").expect("Unix path regex"), "[PATH_REDACTED]"),

        // Network addresses
        (Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(?::\d+)?\b").expect("IPv4 regex"), "[IP_REDACTED]"),

        // Panics and backtraces
        (Regex::new(r"at [^\s]+\.rs:\d+:\d+").expect("Rust location regex"), "[LOCATION_REDACTED]"),
        (Regex::new(r"stack backtrace:[\s\S]*").expect("Stack trace regex"), "[STACK_TRACE_REDACTED]"),
    ]
});

/// Remove secrets, addresses and absolute paths from an error string.
pub fn sanitize_error_details(error: &str) -> String {
    let mut result = error.to_string();

    for (pattern, replacement) in SANITIZE_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }

    result
}

// =============================================================================
// ERROR MAPPING FROM DOMAIN ERRORS
// =============================================================================

/// Map a std::io::Error to a UserError.
pub fn map_io_error(error: &std::io::Error) -> UserError {
    let error_str = error.to_string();

    match error.kind() {
        std::io::ErrorKind::NotFound => UserError::not_found("File or directory not found."),
        std::io::ErrorKind::PermissionDenied => UserError::permission_denied(&error_str),
        std::io::ErrorKind::AlreadyExists => UserError::conflict("File already exists.", None),
        std::io::ErrorKind::InvalidInput => UserError::invalid_request("Invalid path.", Some("path")),
        _ => UserError::internal_error(&error_str),
    }
}

impl From<HarvestError> for UserError {
    fn from(error: HarvestError) -> Self {
        match &error {
            HarvestError::NotFound { .. } => UserError::not_found(&error.to_string()),

            HarvestError::InvalidPath(_) | HarvestError::NotADirectory(_) => {
                UserError::invalid_request(&error.to_string(), Some("path"))
            }
            HarvestError::InvalidRequest(_) | HarvestError::UnsupportedArchive(_) => {
                UserError::invalid_request(&error.to_string(), None)
            }

            HarvestError::PathEscape(path) => UserError::access_denied(path),

            HarvestError::InvalidTransition { from, .. } => {
                UserError::conflict(&error.to_string(), Some(from.to_string()))
            }
            HarvestError::DuplicateId(_)
            | HarvestError::RetryExhausted { .. }
            | HarvestError::ExtractionInProgress(_) => UserError::conflict(&error.to_string(), None),

            HarvestError::TransientRpcFailure(details) => UserError::service_unavailable(details),
            HarvestError::RpcAuthFailure(details) => UserError::bad_gateway(
                "The download engine rejected the configured RPC secret.",
                details,
            ),
            HarvestError::RpcProtocolError(details) => UserError::bad_gateway(
                "The download engine returned an invalid response.",
                details,
            ),
            HarvestError::EngineRejected { code, message } => {
                let message = sanitize_error_details(message);
                UserError::bad_gateway(
                    &format!("The download engine rejected the request: {}", message),
                    &format!("code {}: {}", code, message),
                )
            }

            HarvestError::Io(io) => map_io_error(io),
        }
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================

/// Result type that uses UserError for the error variant.
pub type ApiResult<T> = Result<T, UserError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DownloadStatus;

    #[test]
    fn test_generate_reference_code() {
        let code = generate_reference_code();
        assert!(code.starts_with("ERR-"));
        assert_eq!(code.len(), 19);
        assert_ne!(code, generate_reference_code());
    }

    fn status_of(err: HarvestError) -> StatusCode {
        UserError::from(err).status_code()
    }

    #[test]
    fn test_domain_error_status_codes() {
        assert_eq!(status_of(HarvestError::download_not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status_of(HarvestError::InvalidPath("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(HarvestError::InvalidRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(HarvestError::UnsupportedArchive("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(HarvestError::NotADirectory("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(HarvestError::PathEscape("..".into())), StatusCode::FORBIDDEN);
        assert_eq!(
            status_of(HarvestError::InvalidTransition {
                id: "x".into(),
                from: DownloadStatus::Completed,
                action: "pause"
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(HarvestError::DuplicateId("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(HarvestError::RetryExhausted { id: "x".into(), max: 3 }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(HarvestError::ExtractionInProgress("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(HarvestError::TransientRpcFailure("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(HarvestError::RpcAuthFailure("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_of(HarvestError::RpcProtocolError("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_of(HarvestError::EngineRejected { code: 1, message: "x".into() }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(HarvestError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "x"))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(HarvestError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied))),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_conflict_reports_current_status() {
        let err = UserError::from(HarvestError::InvalidTransition {
            id: "abc".into(),
            from: DownloadStatus::Failed,
            action: "pause",
        });
        match err {
            UserError::Conflict { current_status, message, .. } => {
                assert_eq!(current_status.as_deref(), Some("failed"));
                assert!(message.contains("abc"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_sanitize_secrets_and_paths() {
        let raw = r#"params ["token:hunter2", "x"] failed at 10.0.0.5:6800 writing /home/me/dl/file"#;
        let clean = sanitize_error_details(raw);
        assert!(!clean.contains("hunter2"));
        assert!(!clean.contains("10.0.0.5"));
        assert!(!clean.contains("/home/me"));
        assert!(clean.contains("token:[REDACTED]"));
    }

    #[test]
    fn test_path_escape_message_hides_input() {
        let err = UserError::from(HarvestError::PathEscape("../../etc/shadow".into()));
        assert!(!err.message().contains("shadow"));
    }

    #[test]
    fn test_into_response_is_json() {
        let response = UserError::not_found("download not found: abc").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["content-type"], "application/json");
    }
}
