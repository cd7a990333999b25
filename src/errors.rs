use crate::services::remote::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io::ErrorKind};
use thiserror::Error;

/// Why an upload task ended without success.
///
/// `Validation` is produced at the caller boundary and never reaches a task.
/// Only `TransientNetwork` and `Timeout` are retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("network error: {0}")]
    TransientNetwork(String),
    #[error("upload attempt timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("an upload for `{0}` is already active")]
    AlreadyActive(String),
    #[error("no upload task exists for `{0}`")]
    UnknownTask(String),
    #[error("upload paused")]
    Paused,
    #[error("upload cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::Timeout(_))
    }

    /// Message suitable for showing to the person uploading the document.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(detail) => format!(
                "This file can't be uploaded ({}). Check its size and type, then try again.",
                detail
            ),
            Self::TransientNetwork(_) | Self::Timeout(_) => {
                "A network error interrupted the upload. Please retry.".to_string()
            }
            Self::Permission(_) => {
                "You don't have permission to upload this document.".to_string()
            }
            Self::NotFound(_) => "The upload destination no longer exists.".to_string(),
            Self::AlreadyActive(_) => "This document is already being uploaded.".to_string(),
            Self::UnknownTask(_) => "There is no upload to resume for this document.".to_string(),
            Self::Paused => "The upload was paused.".to_string(),
            Self::Cancelled => "The upload was cancelled.".to_string(),
        }
    }
}

impl From<StorageError> for TransferError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::NotFound(err.to_string()),
            StorageError::PermissionDenied(_)
            | StorageError::QuotaExceeded(_)
            | StorageError::Signing(_) => Self::Permission(err.to_string()),
            StorageError::PayloadTooLarge { .. }
            | StorageError::AlreadyExists { .. }
            | StorageError::InvalidBucketName { .. }
            | StorageError::InvalidPath(_) => Self::Validation(err.to_string()),
            StorageError::Cancelled => Self::Cancelled,
            StorageError::Io(ref io_err) => match io_err.kind() {
                ErrorKind::NotFound => Self::NotFound(err.to_string()),
                ErrorKind::PermissionDenied
                | ErrorKind::ReadOnlyFilesystem
                | ErrorKind::StorageFull
                | ErrorKind::QuotaExceeded => Self::Permission(err.to_string()),
                _ => Self::TransientNetwork(err.to_string()),
            },
            StorageError::Network(_) => Self::TransientNetwork(err.to_string()),
        }
    }
}

/// A lightweight wrapper for HTTP-facing errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::NotFound { .. } => StatusCode::NOT_FOUND,
            StorageError::PermissionDenied(_) | StorageError::Signing(_) => StatusCode::FORBIDDEN,
            StorageError::InvalidBucketName { .. } | StorageError::InvalidPath(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => {
                return AppError::internal(err.to_string());
            }
        };
        AppError::new(status, err.to_string())
    }
}
