//! `POST /upload` -- proxy one multipart file into the object store.
//!
//! The request carries a `file` part and an optional `bucketName` field. The
//! file is buffered in memory (bounded by the upload limit, checked chunk by
//! chunk), credentials are resolved, and the bytes are written in one shot.

use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{Bytes, BytesMut};
use garde::Validate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::UploadError;
use crate::metrics::{UPLOADS_TOTAL, UPLOAD_BYTES_TOTAL};
use crate::AppState;

/// Successful upload response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file_name: String,
    pub public_url: String,
}

/// The file part of an upload form, fully buffered.
#[derive(Debug)]
struct UploadedFile {
    file_name: String,
    content_type: String,
    data: Bytes,
}

#[derive(Debug, Default)]
struct UploadForm {
    file: Option<UploadedFile>,
    bucket_name: Option<String>,
}

/// Bucket name accepted by the object store.
#[derive(Debug, Validate)]
struct BucketNameInput {
    /// 3-63 lowercase alphanumerics, dots, dashes and underscores.
    #[garde(length(min = 3, max = 63), pattern(r"^[a-z0-9][a-z0-9._\-]*[a-z0-9]$"))]
    bucket_name: String,
}

/// Pick the request's bucket, else the configured default.
fn resolve_bucket(requested: Option<&str>, configured: Option<&str>) -> Result<String, UploadError> {
    let bucket = requested
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .or_else(|| configured.map(str::trim).filter(|b| !b.is_empty()))
        .ok_or(UploadError::BucketNotConfigured)?;

    let input = BucketNameInput {
        bucket_name: bucket.to_string(),
    };
    input
        .validate()
        .map_err(|_| UploadError::InvalidBucketName {
            name: bucket.to_string(),
        })?;
    Ok(input.bucket_name)
}

fn map_multipart_error(err: MultipartError, limit: u64) -> UploadError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::PayloadTooLarge { limit }
    } else {
        UploadError::MalformedRequest {
            message: err.body_text(),
        }
    }
}

/// Buffer a file field, rejecting it once it reaches `limit` bytes.
async fn read_file_field(mut field: Field<'_>, limit: u64) -> Result<Bytes, UploadError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| map_multipart_error(e, limit))?
    {
        if (buf.len() + chunk.len()) as u64 >= limit {
            return Err(UploadError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

async fn read_form(mut multipart: Multipart, limit: u64) -> Result<UploadForm, UploadError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| map_multipart_error(e, limit))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                // A `file` part without a filename is a plain text field.
                let Some(file_name) = field.file_name().filter(|n| !n.is_empty()).map(str::to_string)
                else {
                    continue;
                };
                if form.file.is_some() {
                    return Err(UploadError::MalformedRequest {
                        message: "Only one file may be uploaded per request.".to_string(),
                    });
                }
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = read_file_field(field, limit).await?;
                form.file = Some(UploadedFile {
                    file_name,
                    content_type,
                    data,
                });
            }
            Some("bucketName") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| map_multipart_error(e, limit))?;
                form.bucket_name = Some(value);
            }
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    Ok(form)
}

/// `POST /upload` -- Upload one file to the object store.
#[utoipa::path(
    post,
    path = "/upload",
    tag = "Upload",
    operation_id = "UploadFile",
    responses(
        (status = 200, description = "Object stored; body is {fileName, publicUrl}"),
        (status = 400, description = "No file uploaded, or invalid bucket name"),
        (status = 413, description = "File reaches the upload size limit"),
        (status = 500, description = "Configuration, authentication or storage failure")
    )
)]
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, UploadError> {
    let result = handle_upload(&state, multipart).await;
    let outcome = match &result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };
    metrics::counter!(UPLOADS_TOTAL, "outcome" => outcome).increment(1);
    result.map(|body| (StatusCode::OK, Json(body)).into_response())
}

async fn handle_upload(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<UploadResponse, UploadError> {
    let limit = state.config.server.upload_limit();
    let multipart = multipart.map_err(|rejection| {
        debug!("Upload without multipart body: {}", rejection);
        UploadError::MissingFile
    })?;

    let form = read_form(multipart, limit).await?;
    let file = form.file.ok_or(UploadError::MissingFile)?;
    let bucket = resolve_bucket(form.bucket_name.as_deref(), state.config.bucket_name.as_deref())?;

    let credential = state.credentials.obtain_access_token().await?;
    let size = file.data.len() as u64;
    let public_url = state
        .writer
        .write_object(&bucket, &file.file_name, file.data, &file.content_type, &credential)
        .await?;

    metrics::counter!(UPLOAD_BYTES_TOTAL).increment(size);
    info!(
        bucket = %bucket,
        object = %file.file_name,
        size,
        writer = state.writer.name(),
        "Upload stored"
    );

    Ok(UploadResponse {
        file_name: file.file_name,
        public_url,
    })
}
