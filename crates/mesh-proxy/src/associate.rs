//! The associate protocol (§4.E.2): before the proxy forwards a block for a
//! logical peer `P` on a channel that hasn't announced ownership of `P` yet,
//! it must send a `BackendAssociateTargetPeerId` message on that channel.

use std::sync::Arc;

use mesh_client::{BlockDispatch, BlockFromObject, ObjectDispatch};
use mesh_error::MeshError;
use mesh_ids::{ChannelId, PeerId};
use mesh_proto::BrokerProtocolMessage;

use crate::state::ProxyState;

/// Sends the associate message for `(channel, target)` and, on success,
/// records the channel as configured for that peer. Idempotent: a second
/// call against an already-configured channel is a no-op that still
/// succeeds (P2).
pub async fn associate(
    state: &ProxyState,
    dispatch: &Arc<dyn BlockDispatch>,
    channel_id: ChannelId,
    target_peer_id: PeerId,
) -> Result<(), MeshError> {
    if state.is_channel_configured(target_peer_id, channel_id) {
        return Ok(());
    }
    let message = BrokerProtocolMessage::associate(state.peer_id, target_peer_id);
    let adapter = BlockFromObject::new(SingleChannelDispatch { dispatch: dispatch.clone() });
    adapter.push_message(target_peer_id, message, None).await?;
    state.mark_channel_configured(target_peer_id, channel_id);
    Ok(())
}

/// Adapts a single already-selected [`BlockDispatch`] so [`BlockFromObject`]
/// can wrap it without going through the rotating dispatcher again — the
/// associate message must land on the exact channel the caller picked, not
/// wherever the round-robin happens to point next.
struct SingleChannelDispatch {
    dispatch: Arc<dyn BlockDispatch>,
}

#[async_trait::async_trait]
impl BlockDispatch for SingleChannelDispatch {
    fn channel_id(&self) -> ChannelId {
        self.dispatch.channel_id()
    }

    fn is_connected(&self) -> bool {
        self.dispatch.is_connected()
    }

    async fn push_block(&self, target_peer_id: PeerId, block: mesh_proto::DataBlock) -> mesh_error::Result<()> {
        self.dispatch.push_block(target_peer_id, block).await
    }
}
