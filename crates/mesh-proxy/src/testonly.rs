//! In-memory [`BlockDispatch`] fake used by this crate's own tests and
//! available to downstream integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mesh_client::BlockDispatch;
use mesh_error::MeshError;
use mesh_ids::{ChannelId, PeerId};
use mesh_proto::DataBlock;
use parking_lot::Mutex;

pub struct FakeBlockDispatch {
    channel_id: ChannelId,
    connected: AtomicBool,
    pub pushed: Mutex<Vec<(PeerId, DataBlock)>>,
}

impl FakeBlockDispatch {
    pub fn new(connected: bool) -> Arc<Self> {
        Arc::new(Self { channel_id: ChannelId::new(), connected: AtomicBool::new(connected), pushed: Mutex::new(Vec::new()) })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl BlockDispatch for FakeBlockDispatch {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn push_block(&self, target_peer_id: PeerId, block: DataBlock) -> Result<(), MeshError> {
        self.pushed.lock().push((target_peer_id, block));
        Ok(())
    }
}
