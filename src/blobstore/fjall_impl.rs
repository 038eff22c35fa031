use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use fjall::{ReadTransaction, TransactionalKeyspace, TransactionalPartitionHandle};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::*;
use crate::chunker::ChunkingStrategy;

/// Serializable transactions can conflict with each other, in which case the
/// whole transaction is re-run.
const MAX_TX_ATTEMPTS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum FjallStoreError {
    #[error(transparent)]
    Fjall(#[from] fjall::Error),
    #[error("malformed store record")]
    Codec(#[from] postcard::Error),
    #[error("blocking store task failed")]
    Task(#[from] tokio::task::JoinError),
    #[error("transaction on {0:?} kept conflicting")]
    Conflict(String),
    #[error("object {id} is missing chunk {index}")]
    MissingChunk { id: ObjectId, index: u32 },
    #[error("object {0} no longer exists")]
    Gone(ObjectId),
    #[error("payload needs {0} chunks, more than a record can address")]
    TooManyChunks(usize),
}

/// What the `objects` partition holds per object id.
#[derive(Debug, Serialize, Deserialize)]
struct ObjectRecord {
    name: String,
    len: u64,
    chunk_count: u32,
}

fn chunk_index(index: usize) -> Result<u32, FjallStoreError> {
    u32::try_from(index).map_err(|_| FjallStoreError::TooManyChunks(index))
}

fn chunk_key(id: ObjectId, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(&id.0);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

struct Inner {
    database: TransactionalKeyspace,
    objects: TransactionalPartitionHandle,
    chunks: TransactionalPartitionHandle,
    names: TransactionalPartitionHandle,
    chunking: ChunkingStrategy,
}

/// A persistent store on top of a fjall keyspace.
///
/// Every mutation is a single serializable transaction spanning the three
/// partitions, so readers never observe a name pointing at a half-written or
/// half-deleted object.
#[derive(Clone)]
pub struct FjallStore {
    inner: Arc<Inner>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>, chunking: ChunkingStrategy) -> Result<Self, FjallStoreError> {
        let database = fjall::Config::new(path).open_transactional()?;
        let objects = database.open_partition("objects", Default::default())?;
        let chunks = database.open_partition("chunks", Default::default())?;
        let names = database.open_partition("names", Default::default())?;

        let inner = Inner {
            database,
            objects,
            chunks,
            names,
            chunking,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, FjallStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, FjallStoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl Inner {
    fn record(
        &self,
        read_tx: &ReadTransaction,
        id: ObjectId,
    ) -> Result<Option<ObjectRecord>, FjallStoreError> {
        let Some(record) = read_tx.get(&self.objects, id.0)? else {
            return Ok(None);
        };
        Ok(Some(postcard::from_bytes(&record)?))
    }

    fn ids_for(
        &self,
        read_tx: &ReadTransaction,
        name: &str,
    ) -> Result<Vec<ObjectId>, FjallStoreError> {
        match read_tx.get(&self.names, name.as_bytes())? {
            Some(ids) => Ok(postcard::from_bytes(&ids)?),
            None => Ok(vec![]),
        }
    }

    fn find_by_name(&self, name: &str) -> Result<Option<StoredObject>, FjallStoreError> {
        let read_tx = self.database.read_tx();
        for id in self.ids_for(&read_tx, name)?.into_iter().rev() {
            if let Some(record) = self.record(&read_tx, id)? {
                return Ok(Some(StoredObject {
                    id,
                    name: record.name,
                    len: record.len,
                }));
            }
        }
        Ok(None)
    }

    /// Runs `f` inside a write transaction, re-running it on conflicts.
    fn transact<T>(
        &self,
        name: &str,
        mut f: impl FnMut(&mut fjall::WriteTransaction) -> Result<T, FjallStoreError>,
    ) -> Result<T, FjallStoreError> {
        for attempt in 1..=MAX_TX_ATTEMPTS {
            let mut write_tx = self.database.write_tx()?;
            let value = f(&mut write_tx)?;
            match write_tx.commit()? {
                Ok(()) => return Ok(value),
                Err(_conflict) => {
                    tracing::debug!(name, attempt, "write transaction conflicted, retrying");
                }
            }
        }
        Err(FjallStoreError::Conflict(name.into()))
    }

    fn write_object(
        &self,
        write_tx: &mut fjall::WriteTransaction,
        name: &str,
        payload: &Bytes,
    ) -> Result<StoredObject, FjallStoreError> {
        let id = ObjectId::new();
        let chunks = self.chunking.split(payload);
        let record = ObjectRecord {
            name: name.into(),
            len: payload.len() as u64,
            chunk_count: chunk_index(chunks.len())?,
        };

        for (index, chunk) in chunks.iter().enumerate() {
            write_tx.insert(&self.chunks, chunk_key(id, chunk_index(index)?), &chunk[..]);
        }
        write_tx.insert(&self.objects, id.0.to_vec(), postcard::to_stdvec(&record)?);

        Ok(StoredObject {
            id,
            name: record.name,
            len: record.len,
        })
    }

    /// Drops the object and its chunks, returning the name it was stored under.
    fn remove_object(
        &self,
        write_tx: &mut fjall::WriteTransaction,
        id: ObjectId,
    ) -> Result<Option<String>, FjallStoreError> {
        let Some(record) = write_tx.get(&self.objects, id.0)? else {
            return Ok(None);
        };
        let record: ObjectRecord = postcard::from_bytes(&record)?;

        for index in 0..record.chunk_count {
            write_tx.remove(&self.chunks, chunk_key(id, index));
        }
        write_tx.remove(&self.objects, id.0.to_vec());

        Ok(Some(record.name))
    }

    fn tx_ids_for(
        &self,
        write_tx: &mut fjall::WriteTransaction,
        name: &str,
    ) -> Result<Vec<ObjectId>, FjallStoreError> {
        match write_tx.get(&self.names, name.as_bytes())? {
            Some(ids) => Ok(postcard::from_bytes(&ids)?),
            None => Ok(vec![]),
        }
    }

    fn set_ids_for(
        &self,
        write_tx: &mut fjall::WriteTransaction,
        name: &str,
        ids: &[ObjectId],
    ) -> Result<(), FjallStoreError> {
        if ids.is_empty() {
            write_tx.remove(&self.names, name.as_bytes());
        } else {
            write_tx.insert(&self.names, name.as_bytes(), postcard::to_stdvec(ids)?);
        }
        Ok(())
    }

    fn put(&self, name: &str, payload: &Bytes) -> Result<StoredObject, FjallStoreError> {
        self.transact(name, |write_tx| {
            let mut ids = self.tx_ids_for(write_tx, name)?;
            let object = self.write_object(write_tx, name, payload)?;
            ids.push(object.id);
            self.set_ids_for(write_tx, name, &ids)?;
            Ok(object)
        })
    }

    fn delete(&self, id: ObjectId) -> Result<(), FjallStoreError> {
        let label = id.to_string();
        self.transact(&label, |write_tx| {
            let Some(name) = self.remove_object(write_tx, id)? else {
                return Ok(());
            };
            let mut ids = self.tx_ids_for(write_tx, &name)?;
            ids.retain(|other| *other != id);
            self.set_ids_for(write_tx, &name, &ids)
        })
    }

    fn replace(
        &self,
        name: &str,
        payload: &Bytes,
    ) -> Result<(StoredObject, usize), FjallStoreError> {
        self.transact(name, |write_tx| {
            let previous = self.tx_ids_for(write_tx, name)?;
            let mut removed = 0;
            for id in &previous {
                if self.remove_object(write_tx, *id)?.is_some() {
                    removed += 1;
                }
            }
            let object = self.write_object(write_tx, name, payload)?;
            self.set_ids_for(write_tx, name, &[object.id])?;
            Ok((object, removed))
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, FjallStoreError> {
        let read_tx = self.database.read_tx();
        let mut objects = vec![];

        for entry in read_tx.prefix(&self.names, prefix.as_bytes()) {
            let (_name, ids) = entry?;
            let ids: Vec<ObjectId> = postcard::from_bytes(&ids)?;
            for id in ids {
                let Some(record) = self.record(&read_tx, id)? else {
                    continue;
                };
                objects.push(StoredObject {
                    id,
                    name: record.name,
                    len: record.len,
                });
            }
        }
        Ok(objects)
    }

    fn read_chunk(
        &self,
        read_tx: &ReadTransaction,
        id: ObjectId,
        index: u32,
    ) -> Result<Bytes, FjallStoreError> {
        let chunk = read_tx
            .get(&self.chunks, chunk_key(id, index))?
            .ok_or(FjallStoreError::MissingChunk { id, index })?;
        Ok(Bytes::copy_from_slice(&chunk))
    }
}

/// Streams the chunks of `id` as they were in `snapshot`.
///
/// The snapshot moves in and out of every blocking read, a replace that
/// commits while the stream is consumed does not change what it yields.
fn read_chunks(
    inner: Arc<Inner>,
    snapshot: ReadTransaction,
    id: ObjectId,
) -> impl Stream<Item = Result<Bytes, FjallStoreError>> + Send + 'static {
    async_stream::try_stream! {
        let (mut snapshot, record) = {
            let inner = Arc::clone(&inner);
            tokio::task::spawn_blocking(move || {
                let record = inner.record(&snapshot, id);
                (snapshot, record)
            })
            .await?
        };
        let record = record?.ok_or(FjallStoreError::Gone(id))?;

        for index in 0..record.chunk_count {
            let inner = Arc::clone(&inner);
            let (returned, chunk) = tokio::task::spawn_blocking(move || {
                let chunk = inner.read_chunk(&snapshot, id, index);
                (snapshot, chunk)
            })
            .await?;
            snapshot = returned;
            yield chunk?;
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for FjallStore {
    type Error = FjallStoreError;

    async fn find_by_name(&self, name: &str) -> Result<Option<StoredObject>, Self::Error> {
        let name = name.to_owned();
        self.blocking(move |inner| inner.find_by_name(&name)).await
    }

    async fn put(&self, name: &str, payload: Bytes) -> Result<StoredObject, Self::Error> {
        let name = name.to_owned();
        self.blocking(move |inner| inner.put(&name, &payload)).await
    }

    async fn delete(&self, id: ObjectId) -> Result<(), Self::Error> {
        self.blocking(move |inner| inner.delete(id)).await
    }

    async fn replace(
        &self,
        name: &str,
        payload: Bytes,
    ) -> Result<(StoredObject, usize), Self::Error> {
        let name = name.to_owned();
        self.blocking(move |inner| inner.replace(&name, &payload))
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, Self::Error> {
        let prefix = prefix.to_owned();
        self.blocking(move |inner| inner.list(&prefix)).await
    }

    fn stream_read(&self, object: &StoredObject) -> BoxStream<'static, Result<Bytes, Self::Error>> {
        let snapshot = self.inner.database.read_tx();
        read_chunks(Arc::clone(&self.inner), snapshot, object.id).boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;

    use super::*;
    use crate::blobstore::tests::{exercise_store, read_all};

    #[tokio::test]
    async fn test_fjall_store() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(tempdir.path(), ChunkingStrategy::default()).unwrap();

        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_chunked_and_reopened() {
        let tempdir = tempfile::tempdir().unwrap();
        let contents = Bytes::from_static(b"chunked, and persisted file contents...");

        let object = {
            let store = FjallStore::open(tempdir.path(), ChunkingStrategy::fixed(16)).unwrap();
            let object = store.put("targets/x.bin", contents.clone()).await.unwrap();

            let chunks: Vec<_> = store.stream_read(&object).collect().await;
            assert_eq!(chunks.len(), 3);
            assert_eq!(read_all(&store, &object).await, contents);
            object
        };

        let store = FjallStore::open(tempdir.path(), ChunkingStrategy::default()).unwrap();
        let found = store.find_by_name("targets/x.bin").await.unwrap().unwrap();
        assert_eq!(found, object);
        assert_eq!(read_all(&store, &found).await, contents);
    }

    #[tokio::test]
    async fn test_replace_drops_old_chunks() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(tempdir.path(), ChunkingStrategy::fixed(4)).unwrap();

        let old = store
            .put("metadata/timestamp.json", Bytes::from_static(b"{\"version\":1}"))
            .await
            .unwrap();
        let (new, removed) = store
            .replace("metadata/timestamp.json", Bytes::from_static(b"{\"version\":2}"))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let read_old: Result<Vec<Bytes>, _> = store.stream_read(&old).try_collect().await;
        assert!(matches!(read_old, Err(FjallStoreError::Gone(id)) if id == old.id));
        assert_eq!(read_all(&store, &new).await, b"{\"version\":2}");

        let read_tx = store.inner.database.read_tx();
        assert!(store.inner.read_chunk(&read_tx, old.id, 0).is_err());
    }

    #[tokio::test]
    async fn test_read_sees_one_snapshot() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(tempdir.path(), ChunkingStrategy::fixed(4)).unwrap();

        store
            .replace("metadata/timestamp.json", Bytes::from_static(b"{\"version\":1}"))
            .await
            .unwrap();
        let found = store
            .find_by_name("metadata/timestamp.json")
            .await
            .unwrap()
            .unwrap();
        let mut chunks = store.stream_read(&found);

        // the first chunk is pulled before the rotation, the rest after it
        let first = chunks.try_next().await.unwrap().unwrap();
        store
            .replace("metadata/timestamp.json", Bytes::from_static(b"{\"version\":2}"))
            .await
            .unwrap();
        let rest: Vec<Bytes> = chunks.try_collect().await.unwrap();
        assert_eq!([vec![first], rest].concat().concat(), b"{\"version\":1}");
        assert_eq!(found.len, 13);

        // a read opened after the rotation fails instead of coming back empty
        let stale: Result<Vec<Bytes>, _> = store.stream_read(&found).try_collect().await;
        assert!(matches!(stale, Err(FjallStoreError::Gone(id)) if id == found.id));
    }

    #[test]
    fn test_chunk_index_bounds() {
        assert_eq!(chunk_index(0).unwrap(), 0);
        assert_eq!(chunk_index(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            chunk_index(u32::MAX as usize + 1),
            Err(FjallStoreError::TooManyChunks(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replace() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(tempdir.path(), ChunkingStrategy::default()).unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
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

        let listed = store.list("metadata/").await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
