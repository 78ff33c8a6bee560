//! Round-robin dispatch with failover (§4.D): scans a fixed vector of
//! dispatches, advancing a shared atomic index once per entry examined,
//! skipping disconnected entries, and delivers to the first connected one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mesh_error::MeshError;
use mesh_ids::PeerId;
use mesh_proto::DataBlock;

use crate::dispatch::BlockDispatch;

/// Well-known sentinel peer id an empty/all-disconnected dispatch set
/// reports in its [`MeshError`], recognised by upstream retry logic as "no
/// connected dispatch was available right now" rather than "this specific
/// peer is unreachable".
pub const NO_DISPATCH_AVAILABLE_PEER: PeerId = mesh_proto::NO_DISPATCH_AVAILABLE_PEER;

/// Round-robins over a fixed set of [`BlockDispatch`]s, advancing the shared
/// index once per entry examined (so a skipped, disconnected entry is never
/// re-examined by the very next call).
pub struct RotatingDispatch {
    dispatches: Vec<Arc<dyn BlockDispatch>>,
    next_index: AtomicUsize,
}

impl RotatingDispatch {
    pub fn new(dispatches: Vec<Arc<dyn BlockDispatch>>) -> Self {
        Self { dispatches, next_index: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    /// Picks the next connected dispatch, round-robin. Returns `None` if
    /// every dispatch is currently disconnected (or the set is empty). The
    /// shared index is advanced once per entry examined, not once per call:
    /// a disconnected entry that gets skipped must not be handed to the
    /// very next call again.
    pub fn pick(&self) -> Option<Arc<dyn BlockDispatch>> {
        let len = self.dispatches.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let idx = self.next_index.fetch_add(1, Ordering::Relaxed) % len;
            if self.dispatches[idx].is_connected() {
                return Some(self.dispatches[idx].clone());
            }
        }
        None
    }

    pub async fn push_block(&self, target_peer_id: PeerId, block: DataBlock) -> Result<(), MeshError> {
        match self.pick() {
            Some(dispatch) => dispatch.push_block(target_peer_id, block).await,
            None => Err(not_connected()),
        }
    }
}

fn not_connected() -> MeshError {
    MeshError::server(
        mesh_error::ErrorCode::NotConnected,
        format!("no connected dispatch available (peer {NO_DISPATCH_AVAILABLE_PEER})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_ids::ChannelId;
    use std::sync::atomic::AtomicBool;

    struct FakeDispatch {
        channel_id: ChannelId,
        connected: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl BlockDispatch for FakeDispatch {
        fn channel_id(&self) -> ChannelId {
            self.channel_id
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn push_block(&self, _target_peer_id: PeerId, _block: DataBlock) -> mesh_error::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fake(connected: bool) -> Arc<FakeDispatch> {
        Arc::new(FakeDispatch {
            channel_id: ChannelId::new(),
            connected: AtomicBool::new(connected),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn round_robins_across_connected_entries() {
        let a = fake(true);
        let b = fake(true);
        let rotating = RotatingDispatch::new(vec![a.clone(), b.clone()]);
        for _ in 0..4 {
            rotating.push_block(PeerId::new(), DataBlock::with_capacity(0)).await.unwrap();
        }
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn skips_disconnected_entries() {
        let a = fake(false);
        let b = fake(true);
        let rotating = RotatingDispatch::new(vec![a.clone(), b.clone()]);
        rotating.push_block(PeerId::new(), DataBlock::with_capacity(0)).await.unwrap();
        rotating.push_block(PeerId::new(), DataBlock::with_capacity(0)).await.unwrap();
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn advances_past_a_skipped_disconnected_entry_in_the_middle() {
        let d1 = fake(true);
        let d2 = fake(false);
        let d3 = fake(true);
        let rotating = RotatingDispatch::new(vec![d1.clone(), d2.clone(), d3.clone()]);
        rotating.next_index.store(1, Ordering::SeqCst);

        rotating.push_block(PeerId::new(), DataBlock::with_capacity(0)).await.unwrap();
        assert_eq!(d3.calls.load(Ordering::SeqCst), 1);

        rotating.push_block(PeerId::new(), DataBlock::with_capacity(0)).await.unwrap();
        assert_eq!(d1.calls.load(Ordering::SeqCst), 1);
        assert_eq!(d2.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fails_with_not_connected_when_nothing_is_connected() {
        let rotating = RotatingDispatch::new(vec![fake(false), fake(false)]);
        let err = rotating.push_block(PeerId::new(), DataBlock::with_capacity(0)).await.unwrap_err();
        assert_eq!(err.code, mesh_error::ErrorCode::NotConnected);
    }
}
