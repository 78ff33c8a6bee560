//! §4.F.3 Transmitter: issues a `PutDataBlock` per incoming `DataChunkBlock`
//! through the shared client pool, optionally marking the stream as
//! peer-session-tracking so a failure can `FlushPeerSessions` on its way
//! out.

use mesh_error::MeshError;
use mesh_ids::PeerId;
use tokio::sync::mpsc;

use crate::chunk_block::DataChunkBlock;
use crate::config::TransferContext;

/// Consumes `DataChunkBlock`s until `chunk_rx` closes (packager
/// end-of-input), putting each through the context's client pool.
pub async fn run(
    context: &TransferContext,
    source_peer_id: PeerId,
    mut chunk_rx: mpsc::Receiver<DataChunkBlock>,
) -> Result<(), MeshError> {
    while let Some(chunk) = chunk_rx.recv().await {
        if let Err(e) = context.pool.put(chunk.chunk_id, &chunk.data, &context.cancel).await {
            if context.peer_session_tracking {
                if let Err(flush_err) = context.pool.flush_peer_sessions(source_peer_id, &context.cancel).await {
                    tracing::warn!(target: "mesh::transfer", error = %flush_err, "flush_peer_sessions after transmit failure also failed");
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_runtime::CancellationToken;
    use mesh_storage::testonly::InMemoryChunkStore;
    use mesh_storage::{AsyncChunkStorage, StorageConfig};
    use mesh_transport::{BackoffConfig, Connection, TlsMode};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_echo_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let connection = Connection::accept(&listener, &TlsMode::Plain, cancel.clone()).await.unwrap();
            let storage = Arc::new(AsyncChunkStorage::new(InMemoryChunkStore::new(), StorageConfig::default()));
            let session = mesh_protocol_engine::ServerSession::new(
                storage,
                Arc::new(mesh_protocol_engine::NoAuth),
                mesh_protocol_engine::ServerEngineConfig::default(),
            );
            mesh_protocol_engine::run_server_connection(connection, session, cancel).await.unwrap();
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn transmits_every_chunk_through_the_pool() {
        let (addr, server) = spawn_echo_server().await;
        let endpoint = mesh_transport::Endpoint { host: addr.ip().to_string(), port: addr.port() };
        let cancel = CancellationToken::new();
        let pool = crate::pool::ClientPool::connect(
            &[endpoint],
            &TlsMode::Plain,
            PeerId::new(),
            1,
            BackoffConfig::default(),
            &cancel,
        )
        .await
        .unwrap();
        let context = TransferContext::new(Arc::new(pool), cancel.clone());

        let (tx, rx) = mpsc::channel(4);
        let chunk_id = mesh_ids::ChunkId::new();
        tx.send(DataChunkBlock { chunk_id, data: b"hi".to_vec() }).await.unwrap();
        drop(tx);

        run(&context, PeerId::new(), rx).await.unwrap();

        let size = context.pool.get_size(chunk_id, &cancel).await.unwrap();
        assert_eq!(size, 2);
        server.abort();
    }
}
