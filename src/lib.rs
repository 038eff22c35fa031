//! A TUF-style artifact repository.
//!
//! Signed metadata is stored by role under `metadata/<role>.json` and
//! replaced in place, targets are stored content-addressed under
//! `targets/<sha256>.<filename>`. Both live in a [`blobstore::BlobStore`] and
//! are served over HTTP by [`routes::router`].

pub mod blobstore;
pub mod chunker;
pub mod config;
pub mod error;
pub mod ingest;
pub mod naming;
pub mod routes;
pub mod service;

pub use error::AppError;
pub use service::Repository;
