//! `BlockFromObject`/`ObjectFromBlock` (§4.D): lift [`ObjectDispatch`] on top
//! of a [`BlockDispatch`] by packing `{brokerProtocol, payload?}` into one
//! [`DataBlock`] with layout `[ payload ][ protocol-json ]`,
//! `offset1 = len(payload)`.

use mesh_error::MeshError;
use mesh_ids::PeerId;
use mesh_proto::{validate_envelope, BrokerProtocolMessage, DataBlock};

use crate::dispatch::{BlockDispatch, ObjectDispatch};

/// Wraps a [`BlockDispatch`] to expose [`ObjectDispatch`] over it.
pub struct BlockFromObject<D: BlockDispatch> {
    inner: D,
}

impl<D: BlockDispatch> BlockFromObject<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<D: BlockDispatch> ObjectDispatch for BlockFromObject<D> {
    async fn push_message(
        &self,
        target_peer_id: PeerId,
        message: BrokerProtocolMessage,
        payload: Option<Vec<u8>>,
    ) -> mesh_error::Result<()> {
        validate_envelope(&message)?;
        let protocol_json = message.to_packed_json()?;
        let payload = payload.unwrap_or_default();
        let mut block = DataBlock::with_capacity(payload.len() + protocol_json.len());
        block.extend_from_slice(&payload);
        block.extend_from_slice(&protocol_json);
        block.offset1 = payload.len();
        self.inner.push_block(target_peer_id, block).await
    }
}

/// Deserialises the layout [`BlockFromObject`] produces, validating the
/// envelope before handing it back.
pub struct ObjectFromBlock;

impl ObjectFromBlock {
    /// Returns the validated envelope and, if non-empty, the raw payload
    /// bytes that preceded it.
    pub fn decode(block: &DataBlock) -> Result<(BrokerProtocolMessage, Option<Vec<u8>>), MeshError> {
        let (payload, protocol_json) = block.split_at_offset1();
        let message = BrokerProtocolMessage::from_json(protocol_json)?;
        validate_envelope(&message)?;
        let payload = if payload.is_empty() { None } else { Some(payload.to_vec()) };
        Ok((message, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_ids::PeerId;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct RecordingBlockDispatch {
        connected: AtomicBool,
        last_block: parking_lot::Mutex<Option<DataBlock>>,
        channel_id: mesh_ids::ChannelId,
    }

    #[async_trait::async_trait]
    impl BlockDispatch for RecordingBlockDispatch {
        fn channel_id(&self) -> mesh_ids::ChannelId {
            self.channel_id
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn push_block(&self, _target_peer_id: PeerId, block: DataBlock) -> mesh_error::Result<()> {
            *self.last_block.lock() = Some(block);
            Ok(())
        }
    }

    #[tokio::test]
    async fn round_trips_message_and_payload_through_the_block_layout() {
        let dispatch = Arc::new(RecordingBlockDispatch {
            connected: AtomicBool::new(true),
            last_block: parking_lot::Mutex::new(None),
            channel_id: mesh_ids::ChannelId::new(),
        });
        let adapter = BlockFromObject::new(dispatch.clone());
        let message = BrokerProtocolMessage::associate(PeerId::new(), PeerId::new());
        adapter
            .push_message(PeerId::new(), message.clone(), Some(b"hello".to_vec()))
            .await
            .unwrap();

        let block = dispatch.last_block.lock().take().unwrap();
        let (decoded, payload) = ObjectFromBlock::decode(&block).unwrap();
        assert_eq!(decoded.source_peer_id, message.source_peer_id);
        assert_eq!(payload.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn round_trips_with_no_payload() {
        let dispatch = Arc::new(RecordingBlockDispatch {
            connected: AtomicBool::new(true),
            last_block: parking_lot::Mutex::new(None),
            channel_id: mesh_ids::ChannelId::new(),
        });
        let adapter = BlockFromObject::new(dispatch.clone());
        let message = BrokerProtocolMessage::associate(PeerId::new(), PeerId::new());
        adapter.push_message(PeerId::new(), message, None).await.unwrap();

        let block = dispatch.last_block.lock().take().unwrap();
        assert_eq!(block.offset1, 0);
        let (_decoded, payload) = ObjectFromBlock::decode(&block).unwrap();
        assert!(payload.is_none());
    }
}
