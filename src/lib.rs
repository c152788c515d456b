//! assetlift -- upload proxy for Google Cloud Storage.
//!
//! The crate has two halves. The server side accepts one multipart file per
//! request, obtains object store credentials, writes the object and answers
//! with its public URL. The client side keeps a batch of selected files,
//! uploads them concurrently with per-file progress and cancellation, and can
//! ask an inference service to describe uploaded images.

use std::sync::Arc;

pub mod auth;
pub mod client;
pub mod config;
pub mod describe;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod storage;

#[cfg(test)]
mod test_support;

use crate::auth::CredentialProvider;
use crate::config::Config;
use crate::storage::backend::ObjectWriter;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Resolves a credential for each object write.
    pub credentials: Arc<CredentialProvider>,
    /// Object store writer (Cloud Storage or in-memory).
    pub writer: Arc<dyn ObjectWriter>,
}
