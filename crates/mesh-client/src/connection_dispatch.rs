//! A [`BlockDispatch`] backed by one [`ClientSession`]: pushing a block
//! issues a fresh-chunk-id `PutDataBlock` over the wire. Connection state is
//! tracked from the outcome of the last attempted push so `is_connected`
//! reflects reality without a separate heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};

use mesh_error::{MeshError, Retryable};
use mesh_ids::{ChannelId, ChunkId, PeerId};
use mesh_proto::{BlockType, DataBlock};
use mesh_protocol_engine::ClientSession;
use mesh_runtime::CancellationToken;
use tokio::sync::Mutex;

use crate::dispatch::BlockDispatch;

pub struct ConnectionBlockDispatch {
    channel_id: ChannelId,
    session: Mutex<ClientSession>,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionBlockDispatch {
    pub fn new(channel_id: ChannelId, session: ClientSession, cancel: CancellationToken) -> Self {
        Self { channel_id, session: Mutex::new(session), connected: AtomicBool::new(true), cancel }
    }
}

#[async_trait::async_trait]
impl BlockDispatch for ConnectionBlockDispatch {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn push_block(&self, _target_peer_id: PeerId, block: DataBlock) -> Result<(), MeshError> {
        let mut session = self.session.lock().await;
        let result = session.put(ChunkId::new(), BlockType::Normal, block.as_slice(), &self.cancel).await;
        if let Err(e) = &result {
            if e.category() != mesh_error::Category::Aborted {
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        result
    }
}
