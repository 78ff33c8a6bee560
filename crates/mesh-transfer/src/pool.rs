//! A pool of block-transfer client connections (§4.F.3/§4.F.4: "a pool of
//! block-transfer clients", "retried through the rotating dispatch"),
//! round-robined the same way `mesh_client::RotatingDispatch` rotates
//! broker-message dispatches, generalised here to retry a single logical
//! operation across every pool member rather than skip-and-forward.

use std::sync::atomic::{AtomicUsize, Ordering};

use mesh_error::{Category, ErrorCode, MeshError, Retryable};
use mesh_ids::{ChunkId, PeerId};
use mesh_proto::{BlockType, DataBlock};
use mesh_protocol_engine::ClientSession;
use mesh_runtime::CancellationToken;
use mesh_transport::{BackoffConfig, Connection, Endpoint, TlsMode};
use tokio::sync::Mutex;

pub struct ClientPool {
    sessions: Vec<Mutex<ClientSession>>,
    next: AtomicUsize,
}

impl ClientPool {
    /// Connects and hand-shakes one [`ClientSession`] per endpoint in
    /// `endpoints` (already expanded to the desired connection count via
    /// `mesh_transport::expand`).
    pub async fn connect(
        endpoints: &[Endpoint],
        tls: &TlsMode,
        local_peer_id: PeerId,
        client_version: u32,
        backoff: BackoffConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, MeshError> {
        let mut sessions = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let connection =
                Connection::connect(&endpoint.host, endpoint.port, tls, backoff, cancel.clone()).await?;
            let session = ClientSession::handshake(connection, local_peer_id, client_version).await?;
            sessions.push(Mutex::new(session));
        }
        Ok(Self { sessions, next: AtomicUsize::new(0) })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Round-robin order starting from a freshly advanced index, covering
    /// every pool member exactly once.
    fn rotation(&self) -> Vec<usize> {
        if self.sessions.is_empty() {
            return Vec::new();
        }
        let len = self.sessions.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;
        (0..len).map(|offset| (start + offset) % len).collect()
    }

    pub async fn get_size(&self, chunk_id: ChunkId, cancel: &CancellationToken) -> Result<u32, MeshError> {
        let mut last_err = None;
        for idx in self.rotation() {
            let mut session = self.sessions[idx].lock().await;
            match session.get_size(chunk_id, cancel).await {
                Ok(size) => return Ok(size),
                Err(e) if e.category() == Category::TransportExpected => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(empty_pool))
    }

    pub async fn get(
        &self,
        chunk_id: ChunkId,
        expected_size: u32,
        cancel: &CancellationToken,
    ) -> Result<DataBlock, MeshError> {
        let mut last_err = None;
        for idx in self.rotation() {
            let mut session = self.sessions[idx].lock().await;
            match session.get(chunk_id, expected_size, cancel).await {
                Ok(block) => return Ok(block),
                Err(e) if e.category() == Category::TransportExpected => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(empty_pool))
    }

    pub async fn put(&self, chunk_id: ChunkId, data: &[u8], cancel: &CancellationToken) -> Result<(), MeshError> {
        let mut last_err = None;
        for idx in self.rotation() {
            let mut session = self.sessions[idx].lock().await;
            match session.put(chunk_id, BlockType::Normal, data, cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if e.category() == Category::TransportExpected => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(empty_pool))
    }

    pub async fn remove(
        &self,
        chunk_id: ChunkId,
        ignore_if_not_found: bool,
        cancel: &CancellationToken,
    ) -> Result<(), MeshError> {
        let mut last_err = None;
        for idx in self.rotation() {
            let mut session = self.sessions[idx].lock().await;
            match session.remove(chunk_id, ignore_if_not_found, cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if e.category() == Category::TransportExpected => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(empty_pool))
    }

    /// Broadcasts `FlushPeerSessions` to every connection in the pool, not
    /// just the first to succeed: the peer's in-flight state on the
    /// backend may be pinned to any of them.
    pub async fn flush_peer_sessions(&self, source_peer_id: PeerId, cancel: &CancellationToken) -> Result<(), MeshError> {
        let mut last_err = None;
        for session in &self.sessions {
            let mut session = session.lock().await;
            if let Err(e) = session.flush_peer_sessions(source_peer_id, cancel).await {
                tracing::warn!(target: "mesh::transfer", error = %e, "flush_peer_sessions failed on one pool connection");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn empty_pool() -> MeshError {
    MeshError::server(ErrorCode::NotConnected, "client pool is empty or every connection is down")
}
