//! Upload endpoint error types.
//!
//! Every failure the backend can report is a variant of [`UploadError`].
//! The enum implements [`axum::response::IntoResponse`] so handlers can
//! simply return `Err(UploadError::MissingFile)` and the client receives the
//! documented status code and body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{error, warn};

/// Generate a request ID for the `x-request-id` response header.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Backend failures, one per documented outcome.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The multipart form carried no `file` part.
    #[error("No file uploaded.")]
    MissingFile,

    /// No bucket in the request and none configured on the server.
    #[error("Bucket name not configured.")]
    BucketNotConfigured,

    /// The requested bucket name cannot exist in the object store.
    #[error("Invalid bucket name: {name}")]
    InvalidBucketName { name: String },

    /// The file part reached the upload limit.
    #[error("File exceeds the maximum upload size of {limit} bytes.")]
    PayloadTooLarge { limit: u64 },

    /// The multipart body could not be parsed.
    #[error("Malformed upload request: {message}")]
    MalformedRequest { message: String },

    /// Missing or malformed configuration (bucket, service-account key).
    #[error("{0}")]
    Configuration(String),

    /// Token exchange or ambient credential lookup failed.
    #[error("{0}")]
    Authentication(String),

    /// The object store rejected or aborted the write.
    #[error("{0}")]
    StorageWrite(String),

    /// Catch-all for unexpected internal errors.
    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl UploadError {
    /// Short machine-readable error kind, used for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::MissingFile => "missing_file",
            UploadError::BucketNotConfigured => "bucket_not_configured",
            UploadError::InvalidBucketName { .. } => "invalid_bucket_name",
            UploadError::PayloadTooLarge { .. } => "payload_too_large",
            UploadError::MalformedRequest { .. } => "malformed_request",
            UploadError::Configuration(_) => "configuration",
            UploadError::Authentication(_) => "authentication",
            UploadError::StorageWrite(_) => "storage_write",
            UploadError::Internal(_) => "internal",
        }
    }

    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::MissingFile => StatusCode::BAD_REQUEST,
            UploadError::InvalidBucketName { .. } => StatusCode::BAD_REQUEST,
            UploadError::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            UploadError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::BucketNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Authentication(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::StorageWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!(kind = self.kind(), error = ?self, "Upload failed: {}", self);
        } else {
            warn!(kind = self.kind(), "Upload rejected: {}", self);
        }

        // Existing clients match on this exact plain-text body.
        if matches!(self, UploadError::MissingFile) {
            return (
                status,
                [("content-type", "text/plain; charset=utf-8")],
                self.to_string(),
            )
                .into_response();
        }

        (status, Json(serde_json::json!({ "message": self.to_string() }))).into_response()
    }
}

/// Convert a handler panic into a `500 {"message"}` response.
pub fn panic_response(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    };
    error!("Handler panicked: {}", detail);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "message": "Internal server error" })),
    )
        .into_response()
}
