use core::fmt;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};

use super::*;
use crate::chunker::ChunkingStrategy;

#[derive(Debug, thiserror::Error)]
pub enum MemStoreError {
    #[error("object {0} no longer exists")]
    Gone(ObjectId),
}

struct Object {
    name: String,
    len: u64,
    chunks: Vec<Bytes>,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<ObjectId, Object>,
    /// Object ids per name, oldest first.
    names: BTreeMap<String, Vec<ObjectId>>,
}

impl Inner {
    fn stored(&self, id: ObjectId) -> Option<StoredObject> {
        self.objects.get(&id).map(|object| StoredObject {
            id,
            name: object.name.clone(),
            len: object.len,
        })
    }

    fn insert(&mut self, name: &str, len: u64, chunks: Vec<Bytes>) -> StoredObject {
        let id = ObjectId::new();
        self.objects.insert(
            id,
            Object {
                name: name.into(),
                len,
                chunks,
            },
        );
        self.names.entry(name.into()).or_default().push(id);

        StoredObject {
            id,
            name: name.into(),
            len,
        }
    }
}

/// A process-local store, nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
    chunking: ChunkingStrategy,
}

impl MemStore {
    pub fn new(chunking: ChunkingStrategy) -> Self {
        Self {
            inner: Default::default(),
            chunking,
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for MemStore {
    type Error = MemStoreError;

    async fn find_by_name(&self, name: &str) -> Result<Option<StoredObject>, Self::Error> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let newest = inner.names.get(name).and_then(|ids| ids.last());

        Ok(newest.and_then(|id| inner.stored(*id)))
    }

    async fn put(&self, name: &str, payload: Bytes) -> Result<StoredObject, Self::Error> {
        let len = payload.len() as u64;
        let chunks = self.chunking.split(&payload);

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.insert(name, len, chunks))
    }

    async fn delete(&self, id: ObjectId) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(object) = inner.objects.remove(&id) else {
            return Ok(());
        };

        if let Some(ids) = inner.names.get_mut(&object.name) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                inner.names.remove(&object.name);
            }
        }
        Ok(())
    }

    async fn replace(
        &self,
        name: &str,
        payload: Bytes,
    ) -> Result<(StoredObject, usize), Self::Error> {
        let len = payload.len() as u64;
        let chunks = self.chunking.split(&payload);

        // find, delete and put happen under one write lock
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let previous = inner.names.remove(name).unwrap_or_default();
        for id in &previous {
            inner.objects.remove(id);
        }
        let object = inner.insert(name, len, chunks);

        Ok((object, previous.len()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, Self::Error> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let objects = inner
            .names
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(name, _)| name.starts_with(prefix))
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| inner.stored(*id))
            .collect();

        Ok(objects)
    }

    fn stream_read(&self, object: &StoredObject) -> BoxStream<'static, Result<Bytes, Self::Error>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match inner.objects.get(&object.id) {
            Some(stored) => stream::iter(stored.chunks.clone().into_iter().map(Ok)).boxed(),
            None => stream::iter([Err(MemStoreError::Gone(object.id))]).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::TryStreamExt;

    use super::*;
    use crate::blobstore::tests::{exercise_store, read_all};

    #[tokio::test]
    async fn test_memstore() {
        let store = MemStore::default();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_chunked_roundtrip() {
        let store = MemStore::new(ChunkingStrategy::fixed(3));
        let contents = Bytes::from_static(b"chunked file contents");

        let object = store.put("targets/x", contents.clone()).await.unwrap();
        assert_eq!(object.len, contents.len() as u64);

        let chunks: Vec<_> = store.stream_read(&object).collect().await;
        assert_eq!(chunks.len(), 7);
        assert_eq!(read_all(&store, &object).await, contents);
    }

    #[tokio::test]
    async fn test_read_after_delete_fails() {
        let store = MemStore::default();
        let object = store.put("targets/x", Bytes::from_static(b"x")).await.unwrap();
        store.delete(object.id).await.unwrap();

        let read: Result<Vec<Bytes>, _> = store.stream_read(&object).try_collect().await;
        assert!(matches!(read, Err(MemStoreError::Gone(id)) if id == object.id));
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_read_survives_replace() {
        let store = MemStore::new(ChunkingStrategy::fixed(4));
        let (old, _) = store
            .replace("metadata/timestamp.json", Bytes::from_static(b"{\"version\":1}"))
            .await
            .unwrap();

        let chunks = store.stream_read(&old);
        store
            .replace("metadata/timestamp.json", Bytes::from_static(b"{\"version\":2}"))
            .await
            .unwrap();
        let read: Vec<Bytes> = chunks.try_collect().await.unwrap();
        assert_eq!(read.concat(), b"{\"version\":1}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replace() {
        let store = Arc::new(MemStore::default());

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .replace("metadata/timestamp.json", Bytes::from(format!("{i}")))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let listed = store.list("metadata/timestamp.json").await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
