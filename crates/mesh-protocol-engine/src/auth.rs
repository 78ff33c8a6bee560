use mesh_error::MeshError;
use mesh_proto::{BlockType, ControlCode};

/// Backend-supplied authentication policy. A backend that exposes no
/// authentication callback at all should return `false` from
/// `has_auth_callback` and `false` from every `is_auth_required` call: an
/// `Authentication` block is rejected at the block-type validation stage
/// before this trait's `authenticate` is ever invoked.
#[async_trait::async_trait]
pub trait AuthPolicy: Send + Sync + 'static {
    fn has_auth_callback(&self) -> bool;

    /// §4.B.5: does this (block type, command) pair require the connection
    /// to already be authenticated?
    fn is_auth_required(&self, block_type: BlockType, control_code: ControlCode) -> bool;

    /// Validates credentials carried in an `Authentication` block's payload.
    async fn authenticate(&self, payload: &[u8]) -> Result<(), MeshError>;
}

/// No authentication is ever required or possible. The default for a
/// backend that doesn't need the auth gate.
pub struct NoAuth;

#[async_trait::async_trait]
impl AuthPolicy for NoAuth {
    fn has_auth_callback(&self) -> bool {
        false
    }

    fn is_auth_required(&self, _block_type: BlockType, _control_code: ControlCode) -> bool {
        false
    }

    async fn authenticate(&self, _payload: &[u8]) -> Result<(), MeshError> {
        Err(MeshError::fatal("authenticate() called without an auth callback configured"))
    }
}
