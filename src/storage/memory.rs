//! In-memory object writer.
//!
//! Objects are held in a `tokio::sync::RwLock<HashMap<...>>` keyed by
//! `(bucket, object_name)`.  Used for local development
//! (`storage.backend: memory`) and by the endpoint tests.  Public addresses
//! use the same format as the Cloud Storage writer.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::backend::{public_url, ObjectWriter};
use crate::auth::Credential;
use crate::errors::UploadError;

/// A stored object's data plus the content type it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
}

/// In-memory writer. Last write to a name wins.
#[derive(Default)]
pub struct MemoryWriter {
    objects: tokio::sync::RwLock<HashMap<(String, String), StoredObject>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back an object.
    pub async fn get(&self, bucket: &str, object_name: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), object_name.to_string()))
            .cloned()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

impl ObjectWriter for MemoryWriter {
    fn write_object<'a>(
        &'a self,
        bucket: &'a str,
        object_name: &'a str,
        data: Bytes,
        content_type: &'a str,
        _credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<String, UploadError>> + Send + 'a>> {
        Box::pin(async move {
            let object = StoredObject {
                data,
                content_type: content_type.to_string(),
            };
            self.objects
                .write()
                .await
                .insert((bucket.to_string(), object_name.to_string()), object);
            Ok(public_url(bucket, object_name))
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read_back() {
        let writer = MemoryWriter::new();
        assert!(writer.is_empty().await);
        let url = writer
            .write_object(
                "assets",
                "photo.jpg",
                Bytes::from_static(b"jpeg"),
                "image/jpeg",
                &Credential::Ambient,
            )
            .await
            .unwrap();
        assert_eq!(url, "https://storage.googleapis.com/assets/photo.jpg");

        let stored = writer.get("assets", "photo.jpg").await.unwrap();
        assert_eq!(stored.data, Bytes::from_static(b"jpeg"));
        assert_eq!(stored.content_type, "image/jpeg");
        assert!(writer.get("other", "photo.jpg").await.is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let writer = MemoryWriter::new();
        for body in [&b"first"[..], &b"second"[..]] {
            writer
                .write_object(
                    "assets",
                    "a.txt",
                    Bytes::copy_from_slice(body),
                    "text/plain",
                    &Credential::Ambient,
                )
                .await
                .unwrap();
        }
        assert_eq!(writer.len().await, 1);
        assert!(!writer.is_empty().await);
        assert_eq!(
            writer.get("assets", "a.txt").await.unwrap().data,
            Bytes::from_static(b"second")
        );
    }
}
