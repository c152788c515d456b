//! Object store writers.
//!
//! The [`backend::ObjectWriter`] trait abstracts over where uploaded bytes
//! end up.  Implementations include the Cloud Storage media-upload writer
//! and an in-memory writer for local development and tests.

pub mod backend;
pub mod gcs;
pub mod memory;
