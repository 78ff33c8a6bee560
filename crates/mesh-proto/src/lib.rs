//! Wire types for the block-transfer protocol and the broker-protocol JSON
//! envelope it carries: [`wire::CommandBlock`], [`wire::DataBlock`], and
//! [`envelope::BrokerProtocolMessage`], plus the stateless validation rules
//! from the component design.

pub mod envelope;
pub mod validate;
pub mod wire;

pub use envelope::{validate_envelope, BrokerProtocolMessage, MessageType, PrincipalIdentityInfo};
pub use validate::validate_block_type;
pub use wire::{BlockType, CommandBlock, CommandPayload, ControlCode, DataBlock, Flags, HEADER_LEN};

/// A well-known all-zero UUID used by the rotating dispatcher to tag
/// `NotConnected` failures when every dispatch target is disconnected
/// (§4.D, S5), so retry logic can recognise "nobody was reachable" without
/// string-matching the error message.
pub const NO_DISPATCH_AVAILABLE_PEER: mesh_ids::PeerId = mesh_ids::PeerId::nil();
