//! The object store underneath the repository.
//!
//! Objects are addressed by logical name. A store may hold several objects
//! under the same name (like GridFS does), lookups return the newest one.

use core::fmt;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod fjall_impl;
pub mod mem_impl;

pub use fjall_impl::{FjallStore, FjallStoreError};
pub use mem_impl::{MemStore, MemStoreError};

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectId(pub [u8; 16]);

impl ObjectId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:x})", base16ct::HexDisplay(&self.0))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", base16ct::HexDisplay(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub id: ObjectId,
    pub name: String,
    pub len: u64,
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn find_by_name(&self, name: &str) -> Result<Option<StoredObject>, Self::Error>;

    /// Always creates a new object, even if `name` is already taken.
    async fn put(&self, name: &str, payload: Bytes) -> Result<StoredObject, Self::Error>;

    /// Deleting an unknown id is not an error.
    async fn delete(&self, id: ObjectId) -> Result<(), Self::Error>;

    /// Atomically removes every object named `name` and stores `payload` in
    /// their place. Returns the new object and how many were removed.
    async fn replace(
        &self,
        name: &str,
        payload: Bytes,
    ) -> Result<(StoredObject, usize), Self::Error>;

    /// Live objects whose name starts with `prefix`, ordered by name.
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, Self::Error>;

    /// Streams the contents of `object` chunk by chunk, as they were when
    /// this was called. Writes committed later do not show up in the stream,
    /// an object that is already gone yields an error rather than no chunks.
    fn stream_read(&self, object: &StoredObject) -> BoxStream<'static, Result<Bytes, Self::Error>>;
}
