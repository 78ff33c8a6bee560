//! The broker-proxy backend (§4.E): state, associate protocol, timer cycle,
//! request path, and peer connect/disconnect notifications.

mod associate;
mod backend;
mod config;
mod pool;
mod state;

pub mod testonly;

pub use backend::{ProxyActor, ProxyBackend, ProxyDebugView};
pub use config::ProxyConfig;
pub use pool::SmallBlockPool;
pub use state::{ClientState, ProxyState};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use mesh_ids::PeerId;
    use mesh_client::BlockDispatch;
    use mesh_proto::{BrokerProtocolMessage, DataBlock};
    use mesh_runtime::CancellationToken;

    use crate::backend::ProxyBackend;
    use crate::config::ProxyConfig;
    use crate::state::ProxyState;
    use crate::testonly::FakeBlockDispatch;

    fn backend_with(dispatches: Vec<Arc<FakeBlockDispatch>>) -> ProxyBackend {
        let dispatches: Vec<Arc<dyn mesh_client::BlockDispatch>> =
            dispatches.into_iter().map(|d| d as Arc<dyn mesh_client::BlockDispatch>).collect();
        let state = Arc::new(ProxyState::new(PeerId::new(), dispatches, ProxyConfig::default()));
        ProxyBackend::new(state, mesh_runtime::Clock::real(), CancellationToken::new())
    }

    fn envelope_block(source: PeerId, target: PeerId) -> DataBlock {
        let message = BrokerProtocolMessage::associate(source, target);
        let json = message.to_packed_json().unwrap();
        let mut block = DataBlock::with_capacity(json.len() + 64);
        block.extend_from_slice(&json);
        block.offset1 = 0;
        block
    }

    #[tokio::test]
    async fn forwards_through_the_connected_dispatch() {
        let dispatch = FakeBlockDispatch::new(true);
        let backend = backend_with(vec![dispatch.clone()]);
        let target = PeerId::new();
        let block = envelope_block(PeerId::nil(), target);
        backend.create_backend_processing_task(PeerId::new(), target, block).await.unwrap();
        assert_eq!(dispatch.pushed.lock().len(), 1);
    }

    #[tokio::test]
    async fn fails_not_connected_when_no_dispatch_is_up() {
        let dispatch = FakeBlockDispatch::new(false);
        let backend = backend_with(vec![dispatch]);
        let target = PeerId::new();
        let block = envelope_block(PeerId::new(), target);
        let err = backend.create_backend_processing_task(PeerId::new(), target, block).await.unwrap_err();
        assert_eq!(err.code, mesh_error::ErrorCode::NotConnected);
    }

    #[tokio::test]
    async fn rewrites_nil_peer_ids_before_forwarding() {
        let dispatch = FakeBlockDispatch::new(true);
        let backend = backend_with(vec![dispatch.clone()]);
        let source = PeerId::new();
        let target = PeerId::new();
        let block = envelope_block(PeerId::nil(), PeerId::nil());
        backend.create_backend_processing_task(source, target, block).await.unwrap();
        let pushed = dispatch.pushed.lock();
        let (_, block) = &pushed[0];
        let (message, _) = mesh_client::ObjectFromBlock::decode(block).unwrap();
        assert_eq!(message.source_peer_id, source);
        assert_eq!(message.target_peer_id, target);
    }

    #[tokio::test]
    async fn timer_cycle_prunes_clients_absent_past_the_configured_interval() {
        let dispatch = FakeBlockDispatch::new(true);
        let state = Arc::new(ProxyState::new(
            PeerId::new(),
            vec![dispatch as Arc<dyn mesh_client::BlockDispatch>],
            ProxyConfig { prune_interval: Duration::from_millis(0), ..ProxyConfig::default() },
        ));
        let peer = PeerId::new();
        state.note_observed_peer(peer);
        let backend = ProxyBackend::new(state.clone(), mesh_runtime::Clock::real(), CancellationToken::new());
        backend.timer_cycle().await;
        assert!(!state.is_known_client(peer));
    }

    #[tokio::test]
    async fn peer_connected_notify_resets_configured_channels() {
        let dispatch = FakeBlockDispatch::new(true);
        let channel_id = dispatch.channel_id();
        let state = Arc::new(ProxyState::new(
            PeerId::new(),
            vec![dispatch as Arc<dyn mesh_client::BlockDispatch>],
            ProxyConfig::default(),
        ));
        let peer = PeerId::new();
        state.mark_channel_configured(peer, channel_id);
        assert!(state.is_channel_configured(peer, channel_id));
        let backend = ProxyBackend::new(state.clone(), mesh_runtime::Clock::real(), CancellationToken::new());
        backend.peer_connected_notify(peer);
        assert!(!state.is_channel_configured(peer, channel_id));
    }
}
