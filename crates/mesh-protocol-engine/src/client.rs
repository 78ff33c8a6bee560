//! Client-side mirror of [`crate::server`] (§4.B, final paragraph): resolve,
//! connect, `SetProtocolVersion`, then issue commands one at a time over the
//! same wire format, reading back `Ack`/`Err`. Reconnection resets
//! `protocol_version` and mints a fresh `session_id`.

use bytes::BytesMut;
use mesh_error::{ErrorCode, MeshError};
use mesh_ids::{ChunkId, PeerId, SessionId};
use mesh_proto::{BlockType, CommandBlock, CommandPayload, ControlCode, DataBlock, Flags, HEADER_LEN};
use mesh_runtime::CancellationToken;
use mesh_transport::Connection;

/// One outstanding connection to a block-transfer server, from the issuing
/// side. Commands are strictly request/response — the caller must not issue
/// a second command before the first's response has been read.
pub struct ClientSession {
    connection: Connection,
    session_id: SessionId,
    local_peer_id: PeerId,
    protocol_version: u32,
}

impl ClientSession {
    /// Wraps an already-connected transport and performs the
    /// `SetProtocolVersion` handshake the server requires before any other
    /// command is accepted.
    pub async fn handshake(
        connection: Connection,
        local_peer_id: PeerId,
        client_version: u32,
    ) -> Result<Self, MeshError> {
        let mut session = Self {
            connection,
            session_id: SessionId::new(),
            local_peer_id,
            protocol_version: 0,
        };
        let header = CommandBlock {
            control_code: ControlCode::SetProtocolVersion,
            flags: Flags::empty(),
            error_code: ErrorCode::Ok,
            chunk_id: ChunkId::nil(),
            chunk_size: 0,
            peer_id: local_peer_id,
            payload: CommandPayload::Version { protocol_version: client_version },
        };
        let response = session.roundtrip(header, None).await?;
        session.protocol_version = client_version;
        let _ = response;
        Ok(session)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub async fn get_size(&mut self, chunk_id: ChunkId, cancel: &CancellationToken) -> Result<u32, MeshError> {
        let header = self.block_header(ControlCode::GetDataBlockSize, chunk_id, 0, BlockType::Normal, Flags::empty());
        let (response, _) = self.exchange(header, None, cancel).await?;
        Ok(response.chunk_size)
    }

    pub async fn get(&mut self, chunk_id: ChunkId, expected_size: u32, cancel: &CancellationToken) -> Result<DataBlock, MeshError> {
        let header = self.block_header(ControlCode::GetDataBlock, chunk_id, expected_size, BlockType::Normal, Flags::empty());
        let (response, payload) = self.exchange(header, None, cancel).await?;
        let bytes = payload.ok_or_else(|| MeshError::fatal("Get response carried no payload"))?;
        if bytes.len() as u32 != response.chunk_size {
            return Err(MeshError::integrity("Get payload length did not match declared chunk_size"));
        }
        Ok(DataBlock::from_bytes(bytes::Bytes::from(bytes)))
    }

    pub async fn put(
        &mut self,
        chunk_id: ChunkId,
        block_type: BlockType,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), MeshError> {
        let header = self.block_header(ControlCode::PutDataBlock, chunk_id, payload.len() as u32, block_type, Flags::empty());
        self.exchange(header, Some(payload.to_vec()), cancel).await?;
        Ok(())
    }

    pub async fn remove(&mut self, chunk_id: ChunkId, ignore_if_not_found: bool, cancel: &CancellationToken) -> Result<(), MeshError> {
        let flags = if ignore_if_not_found { Flags::IGNORE_IF_NOT_FOUND } else { Flags::empty() };
        let header = self.block_header(ControlCode::RemoveDataBlock, chunk_id, 0, BlockType::Normal, flags);
        self.exchange(header, None, cancel).await?;
        Ok(())
    }

    pub async fn flush_peer_sessions(&mut self, source_peer_id: PeerId, cancel: &CancellationToken) -> Result<(), MeshError> {
        let header = CommandBlock {
            control_code: ControlCode::FlushPeerSessions,
            flags: Flags::empty(),
            error_code: ErrorCode::Ok,
            chunk_id: ChunkId::nil(),
            chunk_size: 0,
            peer_id: source_peer_id,
            payload: CommandPayload::Block { block_type: BlockType::Normal, protocol_data_offset: 0, flags: Flags::empty() },
        };
        self.exchange(header, None, cancel).await?;
        Ok(())
    }

    fn block_header(
        &self,
        control_code: ControlCode,
        chunk_id: ChunkId,
        chunk_size: u32,
        block_type: BlockType,
        flags: Flags,
    ) -> CommandBlock {
        CommandBlock {
            control_code,
            flags,
            error_code: ErrorCode::Ok,
            chunk_id,
            chunk_size,
            peer_id: self.local_peer_id,
            payload: CommandPayload::Block { block_type, protocol_data_offset: 0, flags },
        }
    }

    /// Sends `header` (and `request_payload` for a `Put`), then reads the
    /// response header and, when `Ack` carries a payload (a `Get`'s reply),
    /// its bytes.
    async fn exchange(
        &mut self,
        header: CommandBlock,
        request_payload: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<(CommandBlock, Option<Vec<u8>>), MeshError> {
        if cancel.is_cancelled() {
            return Err(MeshError::aborted());
        }
        let control_code = header.control_code;
        self.send(header, request_payload).await?;
        let response = self.read_response().await?;
        if response.flags.contains(Flags::ERR) {
            return Err(MeshError::server(response.error_code, format!("{control_code:?} failed")));
        }
        let payload = if control_code == ControlCode::GetDataBlock && response.chunk_size > 0 {
            let mut buf = vec![0u8; response.chunk_size as usize];
            self.connection.read_exact(&mut buf).await?;
            Some(buf)
        } else {
            None
        };
        Ok((response, payload))
    }

    async fn roundtrip(&mut self, header: CommandBlock, payload: Option<Vec<u8>>) -> Result<CommandBlock, MeshError> {
        self.send(header, payload).await?;
        let response = self.read_response().await?;
        if response.flags.contains(Flags::ERR) {
            return Err(MeshError::server(response.error_code, "handshake rejected"));
        }
        Ok(response)
    }

    async fn send(&mut self, header: CommandBlock, payload: Option<Vec<u8>>) -> Result<(), MeshError> {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        self.connection.write_all(&buf).await?;
        if let Some(payload) = payload {
            self.connection.write_all(&payload).await?;
        }
        Ok(())
    }

    async fn read_response(&mut self) -> Result<CommandBlock, MeshError> {
        let mut buf = [0u8; HEADER_LEN];
        self.connection.read_exact(&mut buf).await?;
        CommandBlock::decode(&buf).map_err(|e| MeshError::fatal(format!("malformed response header: {e}")))
    }

    pub fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuth;
    use crate::server::{ServerEngineConfig, ServerSession};
    use crate::server_loop::run_server_connection;
    use mesh_storage::testonly::InMemoryChunkStore;
    use mesh_storage::{AsyncChunkStorage, StorageConfig};
    use mesh_transport::TlsMode;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn put_get_remove_round_trip_against_a_real_server_task() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            let connection = Connection::accept(&listener, &TlsMode::Plain, server_cancel.clone()).await.unwrap();
            let storage = Arc::new(AsyncChunkStorage::new(InMemoryChunkStore::new(), StorageConfig::default()));
            let session = ServerSession::new(storage, Arc::new(NoAuth), ServerEngineConfig::default());
            run_server_connection(connection, session, server_cancel).await
        });

        let connection = Connection::connect(
            &addr.ip().to_string(),
            addr.port(),
            &TlsMode::Plain,
            Default::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut client = ClientSession::handshake(connection, PeerId::new(), 1).await.unwrap();
        let cancel = CancellationToken::new();
        let chunk_id = ChunkId::new();
        client.put(chunk_id, BlockType::Normal, b"payload", &cancel).await.unwrap();
        let size = client.get_size(chunk_id, &cancel).await.unwrap();
        assert_eq!(size, 7);
        let block = client.get(chunk_id, 7, &cancel).await.unwrap();
        assert_eq!(block.as_slice(), b"payload");
        client.remove(chunk_id, false, &cancel).await.unwrap();
        let err = client.remove(chunk_id, false, &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSuchFileOrDirectory);

        drop(client);
        server.abort();
    }
}
