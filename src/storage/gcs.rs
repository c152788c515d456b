//! Cloud Storage object writer.
//!
//! Sends each object as a single non-resumable media upload:
//!   `POST {upload_base}/b/{bucket}/o?uploadType=media&name={object}`
//!
//! A media upload either commits the whole object or nothing, so a failed
//! request never leaves a partial object behind.

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{public_url, ObjectWriter};
use crate::auth::{AmbientTokenSource, Credential};
use crate::config::{CredentialsConfig, StorageConfig};
use crate::errors::UploadError;

/// Content type used when the upload carried none.
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

/// Writer that uploads objects to Cloud Storage.
pub struct GcsWriter {
    /// HTTP client for media uploads.
    client: reqwest::Client,
    /// Media upload base URL.
    upload_base: String,
    /// Resolves [`Credential::Ambient`] to a token.
    ambient: AmbientTokenSource,
}

impl GcsWriter {
    pub fn new(storage: &StorageConfig, credentials: &CredentialsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(storage.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        info!("GCS writer initialized: upload_base={}", storage.upload_base);

        Ok(Self {
            ambient: AmbientTokenSource::new(client.clone(), &credentials.metadata_token_url),
            client,
            upload_base: storage.upload_base.trim_end_matches('/').to_string(),
        })
    }

    /// Map a GCS HTTP error to the message surfaced to the uploader.
    fn map_gcs_error(status: StatusCode, body: &str) -> UploadError {
        if let Ok(GcsErrorResponse {
            error: Some(GcsErrorDetail { message: Some(message) }),
        }) = serde_json::from_str::<GcsErrorResponse>(body)
        {
            return UploadError::StorageWrite(message);
        }
        if body.trim().is_empty() {
            UploadError::StorageWrite(format!("Object store returned HTTP {status}"))
        } else {
            UploadError::StorageWrite(format!("Object store returned HTTP {status}: {body}"))
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        object_name: &str,
        data: Bytes,
        content_type: &str,
        credential: &Credential,
    ) -> Result<String, UploadError> {
        let token = self.ambient.bearer(credential).await?;
        let url = format!(
            "{}/b/{}/o",
            self.upload_base,
            super::backend::encode_uri_component(bucket)
        );
        let content_type = if content_type.is_empty() {
            FALLBACK_CONTENT_TYPE
        } else {
            content_type
        };
        let size = data.len();

        let resp = self
            .client
            .post(&url)
            .query(&[("uploadType", "media"), ("name", object_name)])
            .header(AUTHORIZATION, token.authorization_header())
            .header(CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| UploadError::StorageWrite(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error(status, &body));
        }

        debug!("GCS upload complete: gs://{}/{} ({} bytes)", bucket, object_name, size);
        Ok(public_url(bucket, object_name))
    }
}

impl ObjectWriter for GcsWriter {
    fn write_object<'a>(
        &'a self,
        bucket: &'a str,
        object_name: &'a str,
        data: Bytes,
        content_type: &'a str,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<String, UploadError>> + Send + 'a>> {
        Box::pin(self.upload(bucket, object_name, data, content_type, credential))
    }

    fn name(&self) -> &'static str {
        "gcs"
    }
}
