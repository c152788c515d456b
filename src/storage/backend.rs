//! Abstract object writer trait and the public address format.
//!
//! Every writer must implement [`ObjectWriter`].  Whatever the backend, the
//! address handed back to clients is built by [`public_url`]; consumers
//! store and re-derive it, so its encoding must not drift.

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::future::Future;
use std::pin::Pin;

use crate::auth::Credential;
use crate::errors::UploadError;

/// Host serving public objects.
pub const PUBLIC_BASE_URL: &str = "https://storage.googleapis.com";

/// Characters left unescaped by JavaScript's `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Percent-encode `value` exactly like `encodeURIComponent`.
pub fn encode_uri_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

/// `https://storage.googleapis.com/<bucket>/<encoded object name>`
pub fn public_url(bucket: &str, object_name: &str) -> String {
    format!(
        "{PUBLIC_BASE_URL}/{bucket}/{}",
        encode_uri_component(object_name)
    )
}

/// Single-shot object write contract.
pub trait ObjectWriter: Send + Sync + 'static {
    /// Write `data` as `object_name` in `bucket` and return its public
    /// address. The write is not retried; on error nothing is committed.
    fn write_object<'a>(
        &'a self,
        bucket: &'a str,
        object_name: &'a str,
        data: Bytes,
        content_type: &'a str,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<String, UploadError>> + Send + 'a>>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
