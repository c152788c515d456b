//! HTTP request handlers.
//!
//! Each handler extracts its inputs, delegates to the credential provider and
//! the object writer held in [`crate::AppState`], and returns either a JSON
//! body or an [`crate::errors::UploadError`].

pub mod upload;
