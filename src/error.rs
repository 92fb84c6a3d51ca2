// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Domain error taxonomy for the orchestration engine.
//!
//! Every fallible library operation returns [`HarvestError`]. The HTTP layer
//! converts these into user-facing responses in [`crate::errors`].

use thiserror::Error;

use crate::types::DownloadStatus;

/// Errors produced by the engine adapter, registry, orchestrator and file manager.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Engine unreachable, timed out or returned a server error. Safe to retry.
    #[error("engine temporarily unavailable: {0}")]
    TransientRpcFailure(String),

    /// Engine answered with something that is not a valid response.
    #[error("malformed engine response: {0}")]
    RpcProtocolError(String),

    /// Engine refused the shared secret.
    #[error("engine rejected credentials: {0}")]
    RpcAuthFailure(String),

    /// Engine returned a JSON-RPC error object for the call.
    #[error("engine rejected request (code {code}): {message}")]
    EngineRejected { code: i64, message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("cannot {action} download {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: DownloadStatus,
        action: &'static str,
    },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Path resolves outside the managed download root.
    #[error("path escapes the download root: {0}")]
    PathEscape(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("duplicate task id: {0}")]
    DuplicateId(String),

    #[error("retry limit of {max} reached for download {id}")]
    RetryExhausted { id: String, max: u32 },

    #[error("extraction already in progress for {0}")]
    ExtractionInProgress(String),

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    /// Create a not-found error for a download id.
    pub fn download_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "download", id: id.into() }
    }

    /// Create a not-found error for an extraction task id.
    pub fn extraction_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "extraction", id: id.into() }
    }

    /// Create a not-found error for a filesystem path.
    pub fn path_not_found(path: impl Into<String>) -> Self {
        Self::NotFound { kind: "path", id: path.into() }
    }

    /// True only for failures a caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRpcFailure(_))
    }

    /// True for failures that should stop background work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RpcAuthFailure(_))
    }
}

/// Result alias used across the library.
pub type HarvestResult<T> = Result<T, HarvestError>;
