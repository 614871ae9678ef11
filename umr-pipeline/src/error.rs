//! Error types for umr-pipeline
//!
//! Pipeline errors follow the propagation policy of a run:
//! provider failures are absorbed by the chain and surface only as
//! `NoProviderSucceeded`; store failures propagate unchanged and halt the run.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::chain::AttemptRecord;

/// Errors that terminate a pipeline run or an administrative operation
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Every provider failed or returned a malformed result
    #[error("No provider succeeded after {} attempt(s)", attempts.len())]
    NoProviderSucceeded { attempts: Vec<AttemptRecord> },

    /// Image or metadata could not be durably written
    #[error("Archive write failed: {0}")]
    ArchiveWrite(String),

    /// Archived image or metadata could not be read back
    #[error("Archive read failed: {0}")]
    ArchiveRead(String),

    /// Reading log append failed
    #[error("Log write failed: {0}")]
    LogWrite(String),

    /// Reading log could not be read back
    #[error("Log read failed: {0}")]
    LogRead(String),

    /// Capture collaborator failed to supply image bytes
    #[error("Capture failed: {0}")]
    Capture(String),

    /// Captured bytes could not be decoded or rotated
    #[error("Image processing failed: {0}")]
    Image(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    /// Short machine-readable code used in logs and API responses
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::NoProviderSucceeded { .. } => "NO_PROVIDER_SUCCEEDED",
            PipelineError::ArchiveWrite(_) => "ARCHIVE_WRITE_ERROR",
            PipelineError::ArchiveRead(_) => "ARCHIVE_READ_ERROR",
            PipelineError::LogWrite(_) => "LOG_WRITE_ERROR",
            PipelineError::LogRead(_) => "LOG_READ_ERROR",
            PipelineError::Capture(_) => "CAPTURE_ERROR",
            PipelineError::Image(_) => "IMAGE_ERROR",
            PipelineError::NotFound(_) => "NOT_FOUND",
            PipelineError::InvalidInput(_) => "BAD_REQUEST",
        }
    }
}

/// API error type
///
/// Maps pipeline failures onto HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Pipeline run or administrative operation failed
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Pipeline(err) = self;
        let status = match &err {
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::NoProviderSucceeded { .. } | PipelineError::Capture(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let (error_code, message) = (err.code(), err.to_string());

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
