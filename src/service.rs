//! Retrieval and ingestion on top of a [`BlobStore`].

use std::fmt::Display;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use serde::Serialize;

use crate::blobstore::{BlobStore, StoredObject};
use crate::config::{CatchAllContentType, Config};
use crate::error::AppError;
use crate::ingest::{ingest, Upload};
use crate::naming::{content_type_for_key, resolve_retrieval_key, OCTET_STREAM_CONTENT_TYPE};

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub key: String,
}

/// A found object, streamed to the client as the response body.
pub struct Download {
    pub content_type: &'static str,
    pub len: u64,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl IntoResponse for Download {
    fn into_response(self) -> Response {
        let headers = [
            (header::CONTENT_TYPE, HeaderValue::from_static(self.content_type)),
            (header::CONTENT_LENGTH, HeaderValue::from(self.len)),
        ];
        (headers, Body::from_stream(self.body)).into_response()
    }
}

pub struct Repository<B> {
    store: Arc<B>,
    store_timeout: Duration,
    catch_all_content_type: CatchAllContentType,
    info: RepositoryInfo,
}

impl<B> Clone for Repository<B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            store_timeout: self.store_timeout,
            catch_all_content_type: self.catch_all_content_type,
            info: self.info.clone(),
        }
    }
}

impl<B: BlobStore> Repository<B> {
    pub fn new(store: Arc<B>, config: &Config) -> Self {
        Self {
            store,
            store_timeout: config.store_timeout(),
            catch_all_content_type: config.catch_all_content_type,
            info: RepositoryInfo {
                name: config.repo_name.clone(),
                description: config.repo_description.clone(),
            },
        }
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn info(&self) -> &RepositoryInfo {
        &self.info
    }

    /// Runs a single store operation under the configured timeout.
    ///
    /// A timed out `operation` is dropped, which only stops it at its next
    /// await point. Work a store already handed to a blocking thread keeps
    /// running. Writes use [`Self::bounded_write`] instead.
    async fn bounded<T, E: Display>(
        &self,
        context: &str,
        operation: impl Future<Output = Result<T, E>>,
    ) -> Result<T, AppError> {
        match tokio::time::timeout(self.store_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                tracing::error!(context, %err, "blob store operation failed");
                Err(AppError::Internal)
            }
            Err(_) => {
                tracing::error!(context, timeout = ?self.store_timeout, "blob store operation timed out");
                Err(AppError::Unavailable)
            }
        }
    }

    /// Runs a store write on its own task under the configured timeout.
    ///
    /// On timeout the client gets [`AppError::Unavailable`] while the write
    /// runs to completion in the background and may still commit. Its late
    /// outcome is logged under `context`.
    async fn bounded_write<T, E>(
        &self,
        context: String,
        write: impl Future<Output = Result<T, E>> + Send + 'static,
    ) -> Result<T, AppError>
    where
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let mut task = tokio::spawn(write);
        let joined = match tokio::time::timeout(self.store_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::error!(context = %context, timeout = ?self.store_timeout, "blob store write timed out");
                tokio::spawn(async move {
                    match task.await {
                        Ok(Ok(_)) => {
                            tracing::warn!(context = %context, "timed out blob store write committed late")
                        }
                        Ok(Err(err)) => {
                            tracing::error!(context = %context, %err, "timed out blob store write failed")
                        }
                        Err(err) => {
                            tracing::error!(context = %context, %err, "timed out blob store write aborted")
                        }
                    }
                });
                return Err(AppError::Unavailable);
            }
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                tracing::error!(context = %context, %err, "blob store operation failed");
                Err(AppError::Internal)
            }
            Err(err) => {
                tracing::error!(context = %context, %err, "blob store write aborted");
                Err(AppError::Internal)
            }
        }
    }

    /// Looks `name` up under the prefix its suffix implies.
    pub async fn retrieve_by_category(&self, name: &str) -> Result<Download, AppError> {
        let (category, key) = resolve_retrieval_key(name);
        tracing::debug!(%category, key = %key, "looking up file");

        let object = self.bounded(&key, self.store.find_by_name(&key)).await?;
        let Some(object) = object else {
            tracing::warn!(%category, name, "file not found");
            return Err(AppError::NotFound(format!(
                "{} file {name} not found",
                category.label()
            )));
        };

        self.download(object, category.content_type()).await
    }

    /// Looks `path` up exactly as given.
    pub async fn retrieve_verbatim(&self, path: &str) -> Result<Download, AppError> {
        tracing::info!(path, "received request for file");

        let object = self.bounded(path, self.store.find_by_name(path)).await?;
        let Some(object) = object else {
            tracing::warn!(path, "file not found");
            return Err(AppError::NotFound(format!("Target file {path} not found")));
        };

        let content_type = match self.catch_all_content_type {
            CatchAllContentType::OctetStream => OCTET_STREAM_CONTENT_TYPE,
            CatchAllContentType::Infer => content_type_for_key(&object.name),
        };
        self.download(object, content_type).await
    }

    pub async fn upload(&self, upload: Upload) -> Result<UploadResponse, AppError> {
        let filename = upload.filename.clone();
        let category = upload.category;

        let store = Arc::clone(&self.store);
        let ingested = self
            .bounded_write(filename.clone(), async move { ingest(&*store, upload).await })
            .await?;
        tracing::info!(
            %category,
            filename = %filename,
            key = %ingested.object.name,
            len = ingested.object.len,
            "stored upload"
        );

        Ok(UploadResponse {
            message: format!("File {filename} uploaded to {category}"),
            key: ingested.object.name,
        })
    }

    /// Every live object in the store.
    pub async fn inventory(&self) -> Result<Vec<StoredObject>, AppError> {
        self.bounded("inventory", self.store.list("")).await
    }

    /// Opens `object` for streaming. The first chunk is read before the
    /// response is built, a read that fails up front becomes an error status
    /// rather than a truncated body.
    async fn download(
        &self,
        object: StoredObject,
        content_type: &'static str,
    ) -> Result<Download, AppError> {
        let mut chunks = self.store.stream_read(&object);
        let first = self.bounded(&object.name, chunks.try_next()).await?;
        let chunks = stream::iter(first.map(Ok)).chain(chunks).boxed();

        Ok(Download {
            content_type,
            len: object.len,
            body: bounded_chunks(chunks, self.store_timeout, object.name).boxed(),
        })
    }
}

/// Applies the store timeout to every chunk pulled from `chunks`.
fn bounded_chunks<E>(
    mut chunks: BoxStream<'static, Result<Bytes, E>>,
    store_timeout: Duration,
    name: String,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    E: std::error::Error + Send + Sync + 'static,
{
    async_stream::try_stream! {
        loop {
            let next = tokio::time::timeout(store_timeout, chunks.next())
                .await
                .map_err(|_| {
                    tracing::error!(name = %name, "timed out reading from blob store");
                    io::Error::new(io::ErrorKind::TimedOut, "blob store read timed out")
                })?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|err| {
                tracing::error!(name = %name, %err, "failed reading from blob store");
                io::Error::other(err)
            })?;
            yield chunk;
        }
    }
}
