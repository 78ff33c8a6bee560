//! Server-side block-transfer state machine (§4.B), one instance per
//! connection: `ReadCmd → Dispatch → (GetVersion | SetVersion | GetSize |
//! Get | Put | Remove | Flush) → AckOrError → ReadCmd`.

use std::sync::Arc;

use mesh_error::{Category, ErrorCode, MeshError, Retryable};
use mesh_ids::{ChunkId, PeerId, SessionId};
use mesh_proto::{validate_block_type, BlockType, CommandBlock, CommandPayload, ControlCode, DataBlock, Flags};
use mesh_runtime::CancellationToken;
use mesh_storage::{AsyncChunkStorage, ChunkStore};

use crate::auth::AuthPolicy;

#[derive(Clone, Debug)]
pub struct ServerEngineConfig {
    /// `SERVER_MAX`: the highest protocol version this server accepts.
    pub server_max_version: u32,
}

impl Default for ServerEngineConfig {
    fn default() -> Self {
        Self { server_max_version: 1 }
    }
}

/// One request's decoded header plus, for `Put`, its payload bytes already
/// read off the wire by the connection driver.
pub struct Request {
    pub header: CommandBlock,
    pub payload: Option<Vec<u8>>,
}

/// A response the connection driver serialises back onto the wire: the
/// response header (with `Ack`/`Err` + `errorCode` already set) plus an
/// optional payload (set only for a successful `Get`).
pub struct Response {
    pub header: CommandBlock,
    pub payload: Option<Vec<u8>>,
}

fn ack(mut header: CommandBlock) -> Response {
    header.flags = header.flags.union(Flags::ACK);
    header.flags = Flags::from_bits_truncate(header.flags.bits() & !Flags::ERR.bits());
    header.error_code = ErrorCode::Ok;
    Response { header, payload: None }
}

fn ack_with_payload(mut header: CommandBlock, payload: Vec<u8>) -> Response {
    header.flags = header.flags.union(Flags::ACK);
    header.chunk_size = payload.len() as u32;
    header.error_code = ErrorCode::Ok;
    Response { header, payload: Some(payload) }
}

fn err_frame(mut header: CommandBlock, error: &MeshError) -> Response {
    header.flags = header.flags.union(Flags::ACK).union(Flags::ERR);
    header.error_code = error.code;
    header.chunk_size = 0;
    Response { header, payload: None }
}

/// Per-connection state: protocol version, authentication, session/peer
/// identity, and the last-load cache for `GetSize`/`Get` reuse.
pub struct ServerSession<S: ChunkStore> {
    storage: Arc<AsyncChunkStorage<S>>,
    auth: Arc<dyn AuthPolicy>,
    config: ServerEngineConfig,
    protocol_version: u32,
    authenticated: bool,
    session_id: SessionId,
    remote_peer_id: PeerId,
    blocks_transferred: u64,
    last_load: Option<(ChunkId, DataBlock)>,
}

impl<S: ChunkStore> ServerSession<S> {
    pub fn new(
        storage: Arc<AsyncChunkStorage<S>>,
        auth: Arc<dyn AuthPolicy>,
        config: ServerEngineConfig,
    ) -> Self {
        Self {
            storage,
            auth,
            config,
            protocol_version: 0,
            authenticated: false,
            session_id: SessionId::new(),
            remote_peer_id: PeerId::nil(),
            blocks_transferred: 0,
            last_load: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn blocks_transferred(&self) -> u64 {
        self.blocks_transferred
    }

    /// Dispatches one request. Returns `Ok(Response)` for everything that
    /// belongs in a response frame (success or server-error-to-client), and
    /// `Err(MeshError)` only for errors that must close the connection
    /// (fatal server errors, integrity failures, cancellation).
    pub async fn dispatch(
        &mut self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, MeshError> {
        let header = request.header;

        // Version gating (P3): until SetProtocolVersion has succeeded, only
        // GetProtocolVersion/SetProtocolVersion are accepted.
        if self.protocol_version == 0
            && !matches!(
                header.control_code,
                ControlCode::GetProtocolVersion | ControlCode::SetProtocolVersion
            )
        {
            return Ok(err_frame(
                header,
                &MeshError::server(ErrorCode::ProtocolNotSupported, "protocol version not set"),
            ));
        }

        let (block_type, chunk_size_hint) = match header.payload {
            CommandPayload::Block { block_type, .. } => (block_type, header.chunk_size),
            CommandPayload::Version { .. } => (BlockType::TransferOnly, header.chunk_size),
        };

        // Auth gating (P4), ahead of block-type validation so an
        // unauthenticated caller never learns which validation rule would
        // otherwise have fired.
        if self.auth.is_auth_required(block_type, header.control_code) && !self.authenticated {
            return Ok(err_frame(
                header,
                &MeshError::server(ErrorCode::PermissionDenied, "authentication required"),
            ));
        }

        if !matches!(header.control_code, ControlCode::GetProtocolVersion | ControlCode::SetProtocolVersion)
        {
            if let Err(e) = validate_block_type(
                block_type,
                header.control_code,
                header.chunk_id,
                self.auth.has_auth_callback(),
            ) {
                return Ok(err_frame(header, &e));
            }
        }

        let header_for_error = header.clone();
        let result = match header.control_code {
            ControlCode::GetProtocolVersion => Ok(self.handle_get_version(header)),
            ControlCode::SetProtocolVersion => Ok(self.handle_set_version(header)),
            ControlCode::GetDataBlockSize => {
                self.handle_get_size(header, block_type, chunk_size_hint, cancel).await
            }
            ControlCode::GetDataBlock => {
                self.handle_get(header, chunk_size_hint, block_type, cancel).await
            }
            ControlCode::PutDataBlock => self.handle_put(header, request.payload, block_type, cancel).await,
            ControlCode::RemoveDataBlock => self.handle_remove(header, block_type, cancel).await,
            ControlCode::FlushPeerSessions => self.handle_flush(header, block_type).await,
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) if e.category() == Category::ServerToClient => {
                Ok(err_frame(header_for_error, &e))
            }
            Err(e) => Err(e),
        }
    }

    fn handle_get_version(&self, header: CommandBlock) -> Response {
        ack(CommandBlock {
            payload: CommandPayload::Version { protocol_version: self.config.server_max_version },
            ..header
        })
    }

    fn handle_set_version(&mut self, header: CommandBlock) -> Response {
        let requested = match header.payload {
            CommandPayload::Version { protocol_version } => protocol_version,
            _ => 0,
        };
        if requested > self.config.server_max_version {
            return err_frame(
                header,
                &MeshError::server(ErrorCode::ProtocolNotSupported, "client version too new"),
            );
        }
        self.protocol_version = requested.max(1);
        if !header.peer_id.is_nil() && header.peer_id != self.remote_peer_id {
            self.remote_peer_id = header.peer_id;
        }
        ack(header)
    }

    async fn handle_get_size(
        &mut self,
        header: CommandBlock,
        block_type: BlockType,
        chunk_size_hint: u32,
        cancel: &CancellationToken,
    ) -> Result<Response, MeshError> {
        let block = self.load_cached_or_fetch(header.chunk_id, block_type, chunk_size_hint, cancel).await?;
        Ok(ack(CommandBlock { chunk_size: block.size() as u32, ..header }))
    }

    async fn handle_get(
        &mut self,
        header: CommandBlock,
        requested_size: u32,
        block_type: BlockType,
        cancel: &CancellationToken,
    ) -> Result<Response, MeshError> {
        let block = self.load_cached_or_fetch(header.chunk_id, block_type, requested_size, cancel).await?;
        if block.size() as u32 != requested_size {
            return Err(MeshError::server(
                ErrorCode::InvalidArgument,
                format!("requested size {requested_size} does not match stored size {}", block.size()),
            ));
        }
        Ok(ack_with_payload(header, block.as_slice().to_vec()))
    }

    /// `TransferOnly` never reaches the backend: its chunk id is always nil
    /// (shared across every `TransferOnly` block on the session), so a real
    /// `Load` would hand back whatever an unrelated `TransferOnly` block
    /// last secure-discarded there. A fresh zeroed block of `size_hint`
    /// bytes is handed back instead, matching the ground truth's
    /// `SecureAlloc`-without-`Load` path for this case.
    async fn load_cached_or_fetch(
        &mut self,
        chunk_id: ChunkId,
        block_type: BlockType,
        size_hint: u32,
        cancel: &CancellationToken,
    ) -> Result<DataBlock, MeshError> {
        if block_type == BlockType::TransferOnly {
            return Ok(self.storage.secure_alloc(size_hint as usize));
        }
        if let Some((cached_id, block)) = &self.last_load {
            if *cached_id == chunk_id {
                return Ok(block.clone());
            }
        }
        let block = self.storage.get(self.session_id, chunk_id, cancel).await?;
        self.last_load = Some((chunk_id, block.clone()));
        Ok(block)
    }

    async fn handle_put(
        &mut self,
        header: CommandBlock,
        payload: Option<Vec<u8>>,
        block_type: BlockType,
        cancel: &CancellationToken,
    ) -> Result<Response, MeshError> {
        let payload = payload.unwrap_or_default();
        if payload.is_empty() {
            return Err(MeshError::server(ErrorCode::InvalidArgument, "Put requires non-zero size"));
        }
        if block_type == BlockType::Authentication {
            self.auth.authenticate(&payload).await?;
            self.authenticated = true;
            return Ok(ack(header));
        }
        let mut block = self.storage.alloc(payload.len());
        block.extend_from_slice(&payload);
        if block_type == BlockType::TransferOnly {
            // Never persisted: the chunk id is always nil here, shared
            // across every TransferOnly block on the session, so writing it
            // to the backend would overwrite the previous TransferOnly
            // payload under that same key and leak transfer-only content
            // into real storage.
            self.storage.secure_discard(block);
        } else {
            self.storage.put(self.session_id, header.chunk_id, &block, cancel).await?;
            self.last_load = None;
        }
        self.blocks_transferred += 1;
        Ok(ack(header))
    }

    async fn handle_remove(
        &mut self,
        header: CommandBlock,
        block_type: BlockType,
        cancel: &CancellationToken,
    ) -> Result<Response, MeshError> {
        if block_type == BlockType::TransferOnly {
            return Ok(ack(header));
        }
        let ignore_if_not_found = header.flags.contains(Flags::IGNORE_IF_NOT_FOUND);
        self.storage
            .remove(self.session_id, header.chunk_id, ignore_if_not_found, cancel)
            .await?;
        self.last_load = None;
        Ok(ack(header))
    }

    async fn handle_flush(
        &mut self,
        header: CommandBlock,
        block_type: BlockType,
    ) -> Result<Response, MeshError> {
        if block_type == BlockType::TransferOnly {
            return Ok(ack(header));
        }
        self.storage.flush_peer_sessions(header.peer_id).await?;
        Ok(ack(header))
    }
}
