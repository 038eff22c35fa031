//! HTTP surface of the repository.
//!
//! - `GET /` liveness string
//! - `GET /repository/info` static descriptor
//! - `POST /upload` multipart upload of metadata or targets
//! - `GET /metadata/{name}` lookup with the category inferred from `name`
//! - `GET /{*path}` verbatim lookup of any other stored key

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::blobstore::BlobStore;
use crate::error::AppError;
use crate::ingest::Upload;
use crate::service::{Download, Repository, RepositoryInfo, UploadResponse};

/// Which lookup a `GET` path resolves to. The category route is tried first,
/// everything it does not match falls through to the verbatim lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum Retrieval<'a> {
    ByCategory(&'a str),
    Verbatim(&'a str),
}

impl<'a> Retrieval<'a> {
    pub fn route(path: &'a str) -> Self {
        match path.strip_prefix("metadata/") {
            Some(name) if !name.is_empty() && !name.contains('/') => Self::ByCategory(name),
            _ => Self::Verbatim(path),
        }
    }
}

pub fn router<B: BlobStore>(repository: Repository<B>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/repository/info", get(repository_info::<B>))
        .route(
            "/upload",
            post(upload::<B>).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/{*path}", get(retrieve::<B>))
        .layer(TraceLayer::new_for_http())
        .with_state(repository)
}

async fn home() -> Json<&'static str> {
    Json("TUF server")
}

async fn repository_info<B: BlobStore>(
    State(repository): State<Repository<B>>,
) -> Json<RepositoryInfo> {
    Json(repository.info().clone())
}

async fn upload<B: BlobStore>(
    State(repository): State<Repository<B>>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let upload = Upload::from_multipart(multipart).await?;
    let response = repository.upload(upload).await?;

    Ok((StatusCode::CREATED, Json(response)))
}

async fn retrieve<B: BlobStore>(
    State(repository): State<Repository<B>>,
    Path(path): Path<String>,
) -> Result<Download, AppError> {
    match Retrieval::route(&path) {
        Retrieval::ByCategory(name) => repository.retrieve_by_category(name).await,
        Retrieval::Verbatim(path) => repository.retrieve_verbatim(path).await,
    }
}
