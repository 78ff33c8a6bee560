//! Stateless block-type/command-shape validation (§4.B.6). Session-level
//! concerns (version gating, auth gating) live in the protocol engine, which
//! has the connection state these rules don't need.

use mesh_error::{ErrorCode, MeshError};
use mesh_ids::ChunkId;

use crate::wire::{BlockType, ControlCode};

/// `Normal` requires non-nil chunkId. `Authentication` must be
/// `PutDataBlock`. `ServerState` requires `Get` or `GetSize`. `TransferOnly`
/// requires nil chunkId. Invalid combinations are `InvalidArgument`.
pub fn validate_block_type(
    block_type: BlockType,
    control_code: ControlCode,
    chunk_id: ChunkId,
    has_auth_callback: bool,
) -> Result<(), MeshError> {
    match block_type {
        BlockType::Normal => {
            if chunk_id.is_nil() {
                return Err(invalid_argument("Normal block requires a non-nil chunk id"));
            }
        }
        BlockType::Authentication => {
            if control_code != ControlCode::PutDataBlock {
                return Err(invalid_argument("Authentication block is only valid as PutDataBlock"));
            }
            if !has_auth_callback {
                return Err(invalid_argument(
                    "Authentication block requires a backend authentication callback",
                ));
            }
        }
        BlockType::ServerState => {
            if !matches!(control_code, ControlCode::GetDataBlock | ControlCode::GetDataBlockSize) {
                return Err(invalid_argument(
                    "ServerState block only supports GetDataBlock/GetDataBlockSize",
                ));
            }
        }
        BlockType::TransferOnly => {
            if !chunk_id.is_nil() {
                return Err(invalid_argument("TransferOnly block requires a nil chunk id"));
            }
        }
    }
    Ok(())
}

fn invalid_argument(message: impl Into<String>) -> MeshError {
    MeshError::server(ErrorCode::InvalidArgument, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_block_requires_non_nil_chunk_id() {
        let err =
            validate_block_type(BlockType::Normal, ControlCode::GetDataBlock, ChunkId::nil(), false)
                .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        validate_block_type(BlockType::Normal, ControlCode::GetDataBlock, ChunkId::new(), false)
            .expect("valid");
    }

    #[test]
    fn authentication_block_must_be_put_with_callback() {
        assert!(validate_block_type(
            BlockType::Authentication,
            ControlCode::GetDataBlock,
            ChunkId::nil(),
            true
        )
        .is_err());
        assert!(validate_block_type(
            BlockType::Authentication,
            ControlCode::PutDataBlock,
            ChunkId::nil(),
            false
        )
        .is_err());
        assert!(validate_block_type(
            BlockType::Authentication,
            ControlCode::PutDataBlock,
            ChunkId::nil(),
            true
        )
        .is_ok());
    }

    #[test]
    fn server_state_block_limited_to_get_and_get_size() {
        assert!(validate_block_type(
            BlockType::ServerState,
            ControlCode::PutDataBlock,
            ChunkId::nil(),
            false
        )
        .is_err());
        assert!(validate_block_type(
            BlockType::ServerState,
            ControlCode::GetDataBlockSize,
            ChunkId::nil(),
            false
        )
        .is_ok());
    }

    #[test]
    fn transfer_only_block_requires_nil_chunk_id() {
        assert!(validate_block_type(
            BlockType::TransferOnly,
            ControlCode::GetDataBlock,
            ChunkId::new(),
            false
        )
        .is_err());
    }
}
