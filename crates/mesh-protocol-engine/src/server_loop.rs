//! Drives one [`ServerSession`] off a [`mesh_transport::Connection`]:
//! `ReadCmd` loop, terminal on peer close or cancellation.

use bytes::BytesMut;
use mesh_error::{Category, MeshError, Retryable};
use mesh_proto::{CommandBlock, CommandPayload, ControlCode, HEADER_LEN};
use mesh_runtime::CancellationToken;
use mesh_storage::ChunkStore;
use mesh_transport::Connection;

use crate::server::{Request, ServerSession};

/// Runs the server state machine to completion: reads commands until EOF
/// (clean terminal) or a fatal/integrity error (closes the connection and
/// propagates), writing a response frame after every request.
pub async fn run_server_connection<S: ChunkStore>(
    mut connection: Connection,
    mut session: ServerSession<S>,
    cancel: CancellationToken,
) -> Result<(), MeshError> {
    loop {
        let mut header_buf = [0u8; HEADER_LEN];
        match connection.read_exact(&mut header_buf).await {
            Ok(()) => {}
            Err(e) if e.is_expected() => return Ok(()), // peer close / EOF
            Err(e) => return Err(e),
        }
        let header = CommandBlock::decode(&header_buf)
            .map_err(|e| MeshError::fatal(format!("malformed command header: {e}")))?;

        let payload = if header.control_code == ControlCode::PutDataBlock && header.chunk_size > 0 {
            let mut buf = vec![0u8; header.chunk_size as usize];
            connection.read_exact(&mut buf).await?;
            Some(buf)
        } else {
            None
        };

        let response = match session.dispatch(Request { header, payload }, &cancel).await {
            Ok(response) => response,
            Err(e) if e.category() == Category::Aborted => return Ok(()),
            Err(e) => {
                tracing::error!(target: "mesh::protocol", error = %e, "fatal server error, closing connection");
                connection.shutdown(true).await;
                return Err(e);
            }
        };

        let mut encoded = BytesMut::new();
        response.header.encode(&mut encoded);
        connection.write_all(&encoded).await?;
        if let Some(payload) = response.payload {
            if !matches!(response.header.payload, CommandPayload::Version { .. }) {
                connection.write_all(&payload).await?;
            }
        }
    }
}
