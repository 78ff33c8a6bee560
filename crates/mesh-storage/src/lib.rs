//! The async data-chunk storage adapter (§4.C): wraps a synchronous chunk
//! store in a bounded executor, exposing `Alloc`/`SecureAlloc`/`Get`/`Put`/
//! `Remove`/`FlushPeerSessions` as async operations.
//!
//! Ordering guarantee from the concurrency model: per chunk id, operations
//! are FIFO; across chunks, order is unspecified. We key FIFO-ness on
//! `(sessionId, chunkId)` exactly as the component design specifies, using
//! one `tokio::sync::Mutex` per key so that two operations on the same key
//! never run concurrently, while a semaphore caps how many operations (on
//! any key) run at once.

use std::collections::HashMap;
use std::sync::Arc;

use mesh_error::{ErrorCode, MeshError};
use mesh_ids::{ChunkId, PeerId, SessionId};
use mesh_proto::DataBlock;
use mesh_runtime::CancellationToken;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

/// The synchronous chunk store backend this adapter wraps. Implementations
/// are free to choose any on-disk or in-memory representation; the spec
/// leaves the format unconstrained.
pub trait ChunkStore: Send + Sync + 'static {
    fn save(&self, chunk_id: ChunkId, data: &[u8]) -> Result<(), MeshError>;
    fn load(&self, chunk_id: ChunkId) -> Result<Vec<u8>, MeshError>;
    /// Deletes a chunk iff present. Callers applying `IgnoreIfNotFound`
    /// catch [`ErrorCode::NoSuchFileOrDirectory`] themselves; this trait
    /// always reports absence as an error so every caller sees it.
    fn remove(&self, chunk_id: ChunkId) -> Result<(), MeshError>;
    fn flush(&self) -> Result<(), MeshError>;
    /// Drops any per-peer caches the store keeps for `source_peer_id`.
    fn flush_peer_sessions(&self, source_peer_id: PeerId) -> Result<(), MeshError>;
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub max_concurrent_tasks: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { max_concurrent_tasks: 64 }
    }
}

type KeyLock = Arc<AsyncMutex<()>>;

pub struct AsyncChunkStorage<S: ChunkStore> {
    store: Arc<S>,
    semaphore: Arc<Semaphore>,
    key_locks: SyncMutex<HashMap<(SessionId, ChunkId), KeyLock>>,
}

impl<S: ChunkStore> AsyncChunkStorage<S> {
    pub fn new(store: S, config: StorageConfig) -> Self {
        Self {
            store: Arc::new(store),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            key_locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, session_id: SessionId, chunk_id: ChunkId) -> KeyLock {
        self.key_locks.lock().entry((session_id, chunk_id)).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Returns a data block of at least `capacity`, uninitialised. Not a
    /// storage backend operation, so it bypasses the FIFO key lock and the
    /// concurrency semaphore entirely.
    pub fn alloc(&self, capacity: usize) -> DataBlock {
        DataBlock::with_capacity(capacity)
    }

    /// As [`Self::alloc`], but the buffer is zeroed first.
    pub fn secure_alloc(&self, capacity: usize) -> DataBlock {
        DataBlock::with_capacity_zeroed(capacity)
    }

    /// Zeroes and discards a block previously obtained from
    /// [`Self::secure_alloc`]. A block from one capacity class must never be
    /// handed back to a different one; callers are responsible for not
    /// mixing pools, since this adapter has no notion of capacity classes
    /// (that partitioning lives in the caller's block pool, e.g.
    /// `mesh-client`'s small-blocks pool).
    pub fn secure_discard(&self, mut block: DataBlock) {
        block.secure_discard();
    }

    /// Populates a preallocated block with the stored content and sets its
    /// size to the on-store size.
    pub async fn get(
        &self,
        session_id: SessionId,
        chunk_id: ChunkId,
        cancel: &CancellationToken,
    ) -> Result<DataBlock, MeshError> {
        let data = self.run_ordered(session_id, chunk_id, cancel, {
            let store = self.store.clone();
            move || store.load(chunk_id)
        }).await?;
        let mut block = DataBlock::with_capacity(data.len());
        block.extend_from_slice(&data);
        Ok(block)
    }

    /// Persists a block's contents under `chunk_id`. Readers racing a `put`
    /// either see the prior version or the new one, never a partial write,
    /// because the underlying store call runs to completion inside the
    /// per-key lock before any concurrent `get` on the same key is admitted.
    pub async fn put(
        &self,
        session_id: SessionId,
        chunk_id: ChunkId,
        block: &DataBlock,
        cancel: &CancellationToken,
    ) -> Result<(), MeshError> {
        let bytes = block.as_slice().to_vec();
        self.run_ordered(session_id, chunk_id, cancel, {
            let store = self.store.clone();
            move || store.save(chunk_id, &bytes)
        })
        .await
    }

    /// Deletes a chunk. `ignore_if_not_found` maps
    /// [`ErrorCode::NoSuchFileOrDirectory`] into success.
    pub async fn remove(
        &self,
        session_id: SessionId,
        chunk_id: ChunkId,
        ignore_if_not_found: bool,
        cancel: &CancellationToken,
    ) -> Result<(), MeshError> {
        let result = self
            .run_ordered(session_id, chunk_id, cancel, {
                let store = self.store.clone();
                move || store.remove(chunk_id)
            })
            .await;
        match result {
            Err(e) if ignore_if_not_found && e.code == ErrorCode::NoSuchFileOrDirectory => Ok(()),
            other => other,
        }
    }

    pub async fn flush_peer_sessions(&self, source_peer_id: PeerId) -> Result<(), MeshError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.flush_peer_sessions(source_peer_id))
            .await
            .map_err(|e| MeshError::fatal(format!("storage task panicked: {e}")))?
    }

    /// Runs `op` under the per-`(session_id, chunk_id)` FIFO lock, bounded by
    /// the global concurrency semaphore, on the blocking thread pool.
    /// Returns `Aborted` without running `op` if `cancel` fires first, and
    /// the completion is suppressed (never observed by the caller) if
    /// cancellation arrives while `op` is queued on the semaphore.
    async fn run_ordered<T, F>(
        &self,
        session_id: SessionId,
        chunk_id: ChunkId,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, MeshError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, MeshError> + Send + 'static,
    {
        self.run_ordered_typed(session_id, chunk_id, cancel, op).await
    }
}

impl<S: ChunkStore> AsyncChunkStorage<S> {
    async fn run_ordered_typed<T, F>(
        &self,
        session_id: SessionId,
        chunk_id: ChunkId,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, MeshError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, MeshError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(MeshError::aborted());
        }
        let key_lock = self.key_lock(session_id, chunk_id);
        let _key_guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MeshError::aborted()),
            guard = key_lock.lock_owned() => guard,
        };
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MeshError::aborted()),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|e| MeshError::fatal(format!("storage semaphore closed: {e}")))?
            }
        };
        if cancel.is_cancelled() {
            drop(permit);
            return Err(MeshError::aborted());
        }
        let result = tokio::task::spawn_blocking(op)
            .await
            .map_err(|e| MeshError::fatal(format!("storage task panicked: {e}")))?;
        drop(permit);
        result
    }
}

/// In-memory [`ChunkStore`] used by tests across the workspace (the
/// transmitter/receiver/unpackager pipeline tests in `mesh-transfer` build on
/// it too).
pub mod testonly {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[derive(Default)]
    pub struct InMemoryChunkStore {
        chunks: SyncMutex<StdHashMap<ChunkId, Vec<u8>>>,
        flushed_peers: SyncMutex<Vec<PeerId>>,
    }

    impl InMemoryChunkStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn flushed_peers(&self) -> Vec<PeerId> {
            self.flushed_peers.lock().clone()
        }
    }

    impl ChunkStore for InMemoryChunkStore {
        fn save(&self, chunk_id: ChunkId, data: &[u8]) -> Result<(), MeshError> {
            self.chunks.lock().insert(chunk_id, data.to_vec());
            Ok(())
        }

        fn load(&self, chunk_id: ChunkId) -> Result<Vec<u8>, MeshError> {
            self.chunks.lock().get(&chunk_id).cloned().ok_or_else(|| {
                MeshError::server(ErrorCode::NoSuchFileOrDirectory, format!("no chunk {chunk_id}"))
            })
        }

        fn remove(&self, chunk_id: ChunkId) -> Result<(), MeshError> {
            self.chunks.lock().remove(&chunk_id).map(|_| ()).ok_or_else(|| {
                MeshError::server(ErrorCode::NoSuchFileOrDirectory, format!("no chunk {chunk_id}"))
            })
        }

        fn flush(&self) -> Result<(), MeshError> {
            Ok(())
        }

        fn flush_peer_sessions(&self, source_peer_id: PeerId) -> Result<(), MeshError> {
            self.flushed_peers.lock().push(source_peer_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testonly::InMemoryChunkStore;
    use super::*;

    fn storage() -> AsyncChunkStorage<InMemoryChunkStore> {
        AsyncChunkStorage::new(InMemoryChunkStore::new(), StorageConfig::default())
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let storage = storage();
        let cancel = CancellationToken::new();
        let session = SessionId::new();
        let chunk = ChunkId::new();
        let mut block = storage.alloc(3);
        block.extend_from_slice(b"abc");
        storage.put(session, chunk, &block, &cancel).await.unwrap();
        let got = storage.get(session, chunk, &cancel).await.unwrap();
        assert_eq!(got.as_slice(), b"abc");
    }

    #[tokio::test]
    async fn remove_then_get_is_no_such_file() {
        let storage = storage();
        let cancel = CancellationToken::new();
        let session = SessionId::new();
        let chunk = ChunkId::new();
        let mut block = storage.alloc(1);
        block.extend_from_slice(b"a");
        storage.put(session, chunk, &block, &cancel).await.unwrap();
        storage.remove(session, chunk, false, &cancel).await.unwrap();
        let err = storage.get(session, chunk, &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSuchFileOrDirectory);
    }

    #[tokio::test]
    async fn remove_twice_without_ignore_errors_with_ignore_succeeds() {
        let storage = storage();
        let cancel = CancellationToken::new();
        let session = SessionId::new();
        let chunk = ChunkId::new();
        let mut block = storage.alloc(1);
        block.extend_from_slice(b"a");
        storage.put(session, chunk, &block, &cancel).await.unwrap();
        storage.remove(session, chunk, false, &cancel).await.unwrap();
        let err = storage.remove(session, chunk, false, &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSuchFileOrDirectory);
        storage.remove(session, chunk, true, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_running() {
        let storage = storage();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let session = SessionId::new();
        let chunk = ChunkId::new();
        let block = storage.alloc(1);
        let err = storage.put(session, chunk, &block, &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Aborted);
    }

    #[tokio::test]
    async fn flush_peer_sessions_reaches_backend() {
        let storage = storage();
        let peer = PeerId::new();
        storage.flush_peer_sessions(peer).await.unwrap();
        // No direct accessor on the adapter; exercised via the backend in
        // mesh-protocol-engine's own tests. Here we only assert it doesn't
        // error.
    }
}
