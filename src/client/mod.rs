//! Upload client.
//!
//! Keeps a list of selected files, uploads each one to the backend's
//! `/upload` endpoint on its own tokio task, and tracks per-file progress,
//! outcome and cancellation.

pub mod orchestrator;
pub mod task;
pub mod transport;

use thiserror::Error;

pub use orchestrator::UploadOrchestrator;
pub use task::{FileRef, TaskId, TaskStatus, UploadTask};
pub use transport::{HttpTransport, UploadTransport};

/// Failures of a single client-side upload.
///
/// The `Display` text is what ends up in [`UploadTask::error`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The backend base URL cannot be turned into an endpoint.
    #[error("Invalid backend URL: {0}")]
    InvalidEndpoint(String),

    /// Connection refused, reset or otherwise never answered.
    #[error("Network error. Is the backend server running?")]
    Network,

    #[error("Request timed out.")]
    Timeout,

    /// The backend answered with a non-success status.
    #[error("Server Error ({status}): {message}")]
    ServerReported { status: u16, message: String },

    /// A success status whose body is not `{"publicUrl": ...}`.
    #[error("Invalid response from server")]
    MalformedResponse,

    #[error("Upload was cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn server_reported(status: u16, message: impl Into<String>) -> Self {
        Self::ServerReported {
            status,
            message: message.into(),
        }
    }

    /// Network-class failures: the request never got a usable answer.
    pub fn is_network(&self) -> bool {
        matches!(self, ClientError::Network | ClientError::Timeout)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Network
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            ClientError::Network.to_string(),
            "Network error. Is the backend server running?"
        );
        assert_eq!(
            ClientError::server_reported(500, "Bucket name not configured.").to_string(),
            "Server Error (500): Bucket name not configured."
        );
        assert_eq!(
            ClientError::MalformedResponse.to_string(),
            "Invalid response from server"
        );
        assert!(ClientError::Timeout.is_network());
        assert!(!ClientError::MalformedResponse.is_network());
    }
}
