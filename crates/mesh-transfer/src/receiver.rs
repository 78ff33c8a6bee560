//! §4.F.4 Receiver: given an artifact id, iterates its chunk ids and issues
//! `GetDataBlockSize` followed by `GetDataBlock`, emitting `DataChunkBlock`s
//! downstream to the unpackager. Per-chunk connection errors are retried
//! across the client pool's rotation (`ClientPool::get`/`get_size`), not
//! re-implemented here.

use std::sync::Arc;

use mesh_error::MeshError;
use mesh_ids::ArtifactId;
use mesh_metadata::Store;
use tokio::sync::mpsc;

use crate::chunk_block::DataChunkBlock;
use crate::config::TransferContext;

pub async fn run(
    context: &TransferContext,
    store: &Arc<Store>,
    artifact_id: ArtifactId,
    chunk_tx: mpsc::Sender<DataChunkBlock>,
) -> Result<(), MeshError> {
    let handle = store.load(artifact_id)?;
    let chunk_ids: Vec<_> = handle.with_reader(|reader| {
        reader
            .query_all_entries()
            .into_iter()
            .flat_map(|entry_id| reader.load_chunks(entry_id))
            .map(|(chunk_id, _)| chunk_id)
            .collect()
    });

    for chunk_id in chunk_ids {
        let size = context.pool.get_size(chunk_id, &context.cancel).await?;
        let block = context.pool.get(chunk_id, size, &context.cancel).await?;
        let data = block.as_slice().to_vec();
        if chunk_tx.send(DataChunkBlock { chunk_id, data }).await.is_err() {
            return Err(MeshError::aborted());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_ids::{ChunkId, PeerId};
    use mesh_metadata::{ChunkInfo, EntryFlags, EntryInfo, EntryType, Writer};
    use mesh_protocol_engine::{NoAuth, ServerEngineConfig, ServerSession};
    use mesh_runtime::CancellationToken;
    use mesh_storage::testonly::InMemoryChunkStore;
    use mesh_storage::{AsyncChunkStorage, StorageConfig};
    use mesh_transport::{BackoffConfig, Connection, Endpoint, TlsMode};
    use time::OffsetDateTime;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reads_every_chunk_of_an_artifact() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_cancel = CancellationToken::new();
        let accept_cancel = server_cancel.clone();
        let server = tokio::spawn(async move {
            let connection = Connection::accept(&listener, &TlsMode::Plain, accept_cancel.clone()).await.unwrap();
            let storage = Arc::new(AsyncChunkStorage::new(InMemoryChunkStore::new(), StorageConfig::default()));
            let session = ServerSession::new(storage, Arc::new(NoAuth), ServerEngineConfig::default());
            mesh_protocol_engine::run_server_connection(connection, session, accept_cancel).await.unwrap();
        });

        let cancel = CancellationToken::new();
        let pool = crate::pool::ClientPool::connect(
            &[Endpoint { host: addr.ip().to_string(), port: addr.port() }],
            &TlsMode::Plain,
            PeerId::new(),
            1,
            BackoffConfig::default(),
            &cancel,
        )
        .await
        .unwrap();
        let context = TransferContext::new(Arc::new(pool), cancel.clone());

        let store = Arc::new(Store::new());
        let mut writer = Writer::new();
        let entry_id = writer
            .add_entry(EntryInfo {
                rel_path: "a.bin".into(),
                entry_type: EntryType::File,
                size: 4,
                time_created: None,
                last_modified: OffsetDateTime::UNIX_EPOCH,
                flags: EntryFlags::empty(),
                target_path: None,
                checksum: None,
            })
            .unwrap();
        let chunk_id: ChunkId =
            writer.add_chunk(entry_id, ChunkInfo { pos: 0, size: 4, checksum: mesh_ids::crc32(b"data") }).unwrap();
        writer.finalize().unwrap();
        let artifact_id = store.save(writer).unwrap();

        context.pool.put(chunk_id, b"data", &cancel).await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        run(&context, &store, artifact_id, tx).await.unwrap();
        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.chunk_id, chunk_id);
        assert_eq!(chunk.data, b"data");

        server.abort();
    }
}
