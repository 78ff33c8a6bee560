//! The block-transfer wire format: a fixed-size command header optionally
//! followed by a payload, serialised in network byte order.

use bytes::{Buf, BufMut, BytesMut};
use mesh_error::ErrorCode;
use mesh_ids::{ChunkId, PeerId};

/// Fixed-size header, always 1 (control code) + 1 (flags) + 4 (error code) +
/// 16 (chunk id) + 4 (chunk size) + 16 (peer id) + 4 (payload union tag/value)
/// = 46 bytes on the wire.
pub const HEADER_LEN: usize = 46;

#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::IntoStaticStr, strum::EnumString)]
#[repr(u8)]
pub enum ControlCode {
    GetProtocolVersion = 0,
    SetProtocolVersion = 1,
    GetDataBlockSize = 2,
    GetDataBlock = 3,
    PutDataBlock = 4,
    RemoveDataBlock = 5,
    FlushPeerSessions = 6,
}

impl ControlCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::GetProtocolVersion,
            1 => Self::SetProtocolVersion,
            2 => Self::GetDataBlockSize,
            3 => Self::GetDataBlock,
            4 => Self::PutDataBlock,
            5 => Self::RemoveDataBlock,
            6 => Self::FlushPeerSessions,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// `Ack=0x1`, `Err=0x2`, `IgnoreIfNotFound=0x4`.
    #[derive(Copy, Clone, Eq, PartialEq, Default, Debug, Hash)]
    pub struct Flags: u8 {
        const ACK = 0x1;
        const ERR = 0x2;
        const IGNORE_IF_NOT_FOUND = 0x4;
    }
}

/// `BlockType ∈ {Normal, Authentication, ServerState, TransferOnly}`.
/// `Normal` blocks require a non-nil chunk id; `Authentication` blocks are
/// only valid as `PutDataBlock`; `ServerState` blocks only support
/// `GetDataBlockSize`/`GetDataBlock`; `TransferOnly` requires a nil chunk id.
#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::IntoStaticStr)]
pub enum BlockType {
    Normal,
    Authentication,
    ServerState,
    TransferOnly,
}

/// The payload-specific union carried in a command block's header, per the
/// data model: `{protocolVersion} | {blockType, protocolDataOffset, flags}`.
#[derive(Copy, Clone, Debug)]
pub enum CommandPayload {
    Version { protocol_version: u32 },
    Block { block_type: BlockType, protocol_data_offset: u32, flags: Flags },
}

/// On-wire control header, fixed size, host-to-network byte order on
/// transmit.
#[derive(Clone, Debug)]
pub struct CommandBlock {
    pub control_code: ControlCode,
    pub flags: Flags,
    pub error_code: ErrorCode,
    pub chunk_id: ChunkId,
    pub chunk_size: u32,
    pub peer_id: PeerId,
    pub payload: CommandPayload,
}

impl CommandBlock {
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(HEADER_LEN);
        out.put_u8(self.control_code as u8);
        out.put_u8(self.flags.bits());
        out.put_i32(self.error_code as i32);
        out.put_slice(self.chunk_id.as_bytes());
        out.put_u32(self.chunk_size);
        out.put_slice(self.peer_id.as_bytes());
        match self.payload {
            CommandPayload::Version { protocol_version } => {
                out.put_u8(0);
                out.put_u32(protocol_version);
            }
            CommandPayload::Block { block_type, protocol_data_offset, flags } => {
                out.put_u8(1);
                out.put_u8(block_type as u8);
                out.put_u16(0); // reserved, keeps the union fixed-size
                out.put_u32(protocol_data_offset);
                out.put_u8(flags.bits());
                out.put_u8(0); // pad to the declared 4-byte union tail
            }
        }
    }

    /// Decodes a header from exactly [`HEADER_LEN`] bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated { expected: HEADER_LEN, got: buf.len() });
        }
        let control_code =
            ControlCode::from_u8(buf.get_u8()).ok_or(DecodeError::UnknownControlCode)?;
        let flags = Flags::from_bits_truncate(buf.get_u8());
        let error_code = decode_error_code(buf.get_i32())?;
        let mut chunk_bytes = [0u8; 16];
        buf.copy_to_slice(&mut chunk_bytes);
        let chunk_id = ChunkId::from_bytes(chunk_bytes);
        let chunk_size = buf.get_u32();
        let mut peer_bytes = [0u8; 16];
        buf.copy_to_slice(&mut peer_bytes);
        let peer_id = PeerId::from_bytes(peer_bytes);
        let tag = buf.get_u8();
        let payload = match tag {
            0 => {
                let protocol_version = buf.get_u32();
                CommandPayload::Version { protocol_version }
            }
            1 => {
                let block_type = decode_block_type(buf.get_u8())?;
                let _reserved = buf.get_u16();
                let protocol_data_offset = buf.get_u32();
                let block_flags = Flags::from_bits_truncate(buf.get_u8());
                let _pad = buf.get_u8();
                CommandPayload::Block { block_type, protocol_data_offset, flags: block_flags }
            }
            _ => return Err(DecodeError::UnknownPayloadTag),
        };
        Ok(Self { control_code, flags, error_code, chunk_id, chunk_size, peer_id, payload })
    }
}

fn decode_error_code(value: i32) -> Result<ErrorCode, DecodeError> {
    use ErrorCode::*;
    core::result::Result::Ok(match value {
        0 => Ok,
        1 => InvalidArgument,
        2 => PermissionDenied,
        3 => ProtocolNotSupported,
        4 => NoSuchFileOrDirectory,
        5 => TargetPeerNotFound,
        6 => TargetPeerQueueFull,
        7 => ProtocolValidationFailed,
        8 => Aborted,
        9 => NotConnected,
        10 => IntegrityMismatch,
        11 => Internal,
        _ => return Err(DecodeError::UnknownErrorCode(value)),
    })
}

fn decode_block_type(value: u8) -> Result<BlockType, DecodeError> {
    Ok(match value {
        0 => BlockType::Normal,
        1 => BlockType::Authentication,
        2 => BlockType::ServerState,
        3 => BlockType::TransferOnly,
        _ => return Err(DecodeError::UnknownBlockType),
    })
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum DecodeError {
    #[error("header truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("unknown control code")]
    UnknownControlCode,
    #[error("unknown error code {0}")]
    UnknownErrorCode(i32),
    #[error("unknown block type")]
    UnknownBlockType,
    #[error("unknown payload tag")]
    UnknownPayloadTag,
}

/// Owned byte buffer for chunk/associate payloads, with the
/// `begin/end/size/capacity/offset1` shape from the data model. `offset1`
/// marks the split between the protocol-data prefix and the payload prefix
/// of a serialised broker-protocol message stored in this block.
#[derive(Clone, Debug, Default)]
pub struct DataBlock {
    buf: BytesMut,
    pub offset1: usize,
}

impl DataBlock {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity), offset1: 0 }
    }

    /// Allocates a block zeroed out, per `SecureAlloc`'s contract.
    pub fn with_capacity_zeroed(capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity);
        buf.resize(capacity, 0);
        buf.truncate(0);
        Self { buf, offset1: 0 }
    }

    pub fn from_bytes(bytes: impl Into<BytesMut>) -> Self {
        Self { buf: bytes.into(), offset1: 0 }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn split_at_offset1(&self) -> (&[u8], &[u8]) {
        self.buf.split_at(self.offset1.min(self.buf.len()))
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    /// Zeroes out the buffer's used bytes. Called before returning a block
    /// from `SecureAlloc` to a different capacity class, or before
    /// discarding a buffer that held authentication material.
    pub fn secure_discard(&mut self) {
        for byte in self.buf.iter_mut() {
            *byte = 0;
        }
        self.buf.truncate(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CommandBlock {
        CommandBlock {
            control_code: ControlCode::PutDataBlock,
            flags: Flags::ACK | Flags::IGNORE_IF_NOT_FOUND,
            error_code: ErrorCode::Ok,
            chunk_id: ChunkId::new(),
            chunk_size: 4096,
            peer_id: PeerId::new(),
            payload: CommandPayload::Block {
                block_type: BlockType::Normal,
                protocol_data_offset: 12,
                flags: Flags::ACK,
            },
        }
    }

    #[test]
    fn round_trips_block_payload() {
        let block = sample();
        let mut buf = BytesMut::new();
        block.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = CommandBlock::decode(&buf).expect("decode");
        assert_eq!(decoded.control_code, block.control_code);
        assert_eq!(decoded.chunk_id, block.chunk_id);
        assert_eq!(decoded.peer_id, block.peer_id);
        assert!(decoded.flags.contains(Flags::ACK));
        assert!(decoded.flags.contains(Flags::IGNORE_IF_NOT_FOUND));
        match decoded.payload {
            CommandPayload::Block { block_type, protocol_data_offset, flags } => {
                assert_eq!(block_type, BlockType::Normal);
                assert_eq!(protocol_data_offset, 12);
                assert!(flags.contains(Flags::ACK));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn round_trips_version_payload() {
        let block = CommandBlock {
            control_code: ControlCode::SetProtocolVersion,
            flags: Flags::empty(),
            error_code: ErrorCode::Ok,
            chunk_id: ChunkId::nil(),
            chunk_size: 0,
            peer_id: PeerId::nil(),
            payload: CommandPayload::Version { protocol_version: 3 },
        };
        let mut buf = BytesMut::new();
        block.encode(&mut buf);
        let decoded = CommandBlock::decode(&buf).expect("decode");
        match decoded.payload {
            CommandPayload::Version { protocol_version } => assert_eq!(protocol_version, 3),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_header() {
        let err = CommandBlock::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { expected: HEADER_LEN, got: 10 });
    }

    #[test]
    fn data_block_secure_discard_zeroes_and_empties() {
        let mut block = DataBlock::with_capacity(16);
        block.extend_from_slice(b"secret-token");
        block.secure_discard();
        assert_eq!(block.size(), 0);
    }
}
