//! Turns an upload into a stored object.

use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;
use bytes::Bytes;

use crate::blobstore::{BlobStore, StoredObject};
use crate::error::AppError;
use crate::naming::{metadata_key, target_key, validate_filename, Category};

pub const INVALID_CATEGORY_MESSAGE: &str = "Invalid category. Use 'metadata' or 'targets'.";

#[derive(Debug, Clone)]
pub struct Upload {
    pub category: Category,
    pub filename: String,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct Ingested {
    pub object: StoredObject,
    /// Objects that previously held the same metadata name.
    pub replaced: usize,
}

impl Upload {
    pub fn storage_key(&self) -> String {
        match self.category {
            Category::Targets => target_key(&self.filename, &self.payload),
            Category::Metadata => metadata_key(&self.filename),
        }
    }

    /// Reads the `category` field and the `file` part of a multipart body.
    /// The file is buffered completely, it has to be hashed before it can be
    /// named.
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut category = None;
        let mut file = None;

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().map(str::to_owned);
            match name.as_deref() {
                Some("category") => {
                    category = Some(field.text().await.map_err(multipart_error)?);
                }
                Some("file") => {
                    let filename = field.file_name().map(str::to_owned);
                    let payload = field.bytes().await.map_err(multipart_error)?;
                    file = Some((filename, payload));
                }
                _ => {}
            }
        }

        let category: Category = category
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|err| {
                tracing::warn!(%err, "rejecting upload");
                AppError::BadRequest(INVALID_CATEGORY_MESSAGE.into())
            })?;

        let Some((filename, payload)) = file else {
            tracing::warn!(%category, "upload without a file part");
            return Err(AppError::BadRequest("Missing 'file' part.".into()));
        };
        let filename = filename.unwrap_or_default();
        validate_filename(&filename).map_err(|err| {
            tracing::warn!(%category, %err, "rejecting upload");
            AppError::BadRequest(format!("Invalid filename: {err}"))
        })?;

        Ok(Self {
            category,
            filename,
            payload,
        })
    }
}

fn multipart_error(err: MultipartError) -> AppError {
    tracing::warn!(err = %err.body_text(), "malformed upload");
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge
    } else {
        AppError::BadRequest(err.body_text())
    }
}

/// Writes `upload` to the store.
///
/// Targets are put unconditionally, identical bytes map to an identical key.
/// Metadata is single-slot per role: whatever was stored under the role name
/// is replaced in the same atomic step.
pub async fn ingest<B: BlobStore>(store: &B, upload: Upload) -> Result<Ingested, B::Error> {
    let key = upload.storage_key();

    match upload.category {
        Category::Targets => {
            let object = store.put(&key, upload.payload).await?;
            Ok(Ingested {
                object,
                replaced: 0,
            })
        }
        Category::Metadata => {
            let (object, replaced) = store.replace(&key, upload.payload).await?;
            if replaced > 0 {
                tracing::info!(key = %key, replaced, "overwrote existing metadata");
            }
            Ok(Ingested { object, replaced })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::tests::read_all;
    use crate::blobstore::MemStore;

    fn upload(category: Category, filename: &str, payload: &'static [u8]) -> Upload {
        Upload {
            category,
            filename: filename.into(),
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_targets_are_content_addressed() {
        let store = MemStore::default();

        let first = ingest(&store, upload(Category::Targets, "a.bin", b"payload"))
            .await
            .unwrap();
        let second = ingest(&store, upload(Category::Targets, "a.bin", b"payload"))
            .await
            .unwrap();
        assert_eq!(first.object.name, second.object.name);
        assert_eq!(first.object.name, target_key("a.bin", b"payload"));
        assert_eq!(second.replaced, 0);

        let other = ingest(&store, upload(Category::Targets, "a.bin", b"other"))
            .await
            .unwrap();
        assert_ne!(other.object.name, first.object.name);
    }

    #[tokio::test]
    async fn test_timestamp_rotation() {
        let store = MemStore::default();

        let first = ingest(&store, upload(Category::Metadata, "timestamp.json", b"{\"v\":1}"))
            .await
            .unwrap();
        assert_eq!(first.replaced, 0);
        let second = ingest(&store, upload(Category::Metadata, "timestamp.json", b"{\"v\":2}"))
            .await
            .unwrap();
        assert_eq!(second.replaced, 1);

        let live = store.list("metadata/timestamp.json").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(read_all(&store, &live[0]).await, b"{\"v\":2}");
    }

    #[tokio::test]
    async fn test_other_roles_are_single_slot_too() {
        let store = MemStore::default();

        for payload in [&b"{\"v\":1}"[..], b"{\"v\":2}", b"{\"v\":3}"] {
            ingest(&store, upload(Category::Metadata, "snapshot.json", payload))
                .await
                .unwrap();
        }
        ingest(&store, upload(Category::Metadata, "root.json", b"{}"))
            .await
            .unwrap();

        let live = store.list("metadata/").await.unwrap();
        assert_eq!(live.len(), 2);
        let snapshot = store.find_by_name("metadata/snapshot.json").await.unwrap().unwrap();
        assert_eq!(read_all(&store, &snapshot).await, b"{\"v\":3}");
    }
}
