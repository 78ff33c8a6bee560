//! The two stacked dispatch surfaces a messaging client exposes over one
//! connection (§4.D): block dispatch (raw [`DataBlock`]s) and object dispatch
//! (structured broker-protocol messages), the latter built atop the former
//! via the adapters in [`crate::adapters`].

use std::sync::Arc;

use mesh_ids::{ChannelId, PeerId};
use mesh_proto::{BrokerProtocolMessage, DataBlock};

/// Pushes raw data blocks to a target peer over one channel.
#[async_trait::async_trait]
pub trait BlockDispatch: Send + Sync {
    /// The channel this dispatch delivers on. Stable for the dispatch's
    /// lifetime; a reconnect keeps the same channel id.
    fn channel_id(&self) -> ChannelId;

    fn is_connected(&self) -> bool;

    /// Whether blocks pushed through this dispatch may be mutated by the
    /// transport layer (e.g. in-place encryption) rather than copied. `false`
    /// is always a safe answer; `true` is an optimisation a caller may use to
    /// skip a defensive copy before the call.
    fn is_no_copy_data_blocks(&self) -> bool {
        false
    }

    async fn push_block(&self, target_peer_id: PeerId, block: DataBlock) -> mesh_error::Result<()>;
}

#[async_trait::async_trait]
impl<T: BlockDispatch + ?Sized> BlockDispatch for Arc<T> {
    fn channel_id(&self) -> ChannelId {
        (**self).channel_id()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn is_no_copy_data_blocks(&self) -> bool {
        (**self).is_no_copy_data_blocks()
    }

    async fn push_block(&self, target_peer_id: PeerId, block: DataBlock) -> mesh_error::Result<()> {
        (**self).push_block(target_peer_id, block).await
    }
}

/// Pushes structured broker-protocol messages, optionally carrying a raw
/// payload, to a target peer.
#[async_trait::async_trait]
pub trait ObjectDispatch: Send + Sync {
    async fn push_message(
        &self,
        target_peer_id: PeerId,
        message: BrokerProtocolMessage,
        payload: Option<Vec<u8>>,
    ) -> mesh_error::Result<()>;
}
