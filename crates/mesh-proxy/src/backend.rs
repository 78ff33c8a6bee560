//! The broker-proxy backend (§4.E): simultaneously an acceptor-side
//! receiver for incoming client connections and a forwarder that relays
//! client blocks onward to the real broker through a pool of block clients.
//! Structured as an `actix::Actor` whose `started()` kicks off the
//! associate/prune timer cycle, mirroring `PeerManagerActor`'s
//! `monitor_peers_trigger` self-rescheduling idiom.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix::fut::future::wrap_future;
use actix::{Actor as _, AsyncContext as _};
use mesh_client::BlockDispatch;
use mesh_error::{ErrorCode, MeshError};
use mesh_ids::PeerId;
use mesh_proto::{validate_envelope, BrokerProtocolMessage, DataBlock};
use mesh_runtime::CancellationToken;

use crate::associate::associate;
use crate::state::ProxyState;

/// Structured snapshot of proxy state for tests and operational
/// introspection (§2 supplemented feature; no network-exposed RPC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDebugView {
    pub connected_channels: usize,
    pub tracked_peers: usize,
    pub peers_pending_prune: usize,
    pub small_blocks_outstanding: usize,
}

pub struct ProxyBackend {
    state: Arc<ProxyState>,
    clock: mesh_runtime::Clock,
    cancel: CancellationToken,
    /// Period the *next* timer tick should be scheduled after, updated by
    /// [`Self::timer_cycle`] once that tick's back-pressure outcome is
    /// known. Read synchronously when rescheduling, mirroring the teacher's
    /// self-rescheduling trigger functions (`monitor_peers_trigger`), which
    /// likewise decide the next interval without awaiting the work they
    /// just spawned.
    next_period_millis: AtomicU64,
}

impl ProxyBackend {
    pub fn new(state: Arc<ProxyState>, clock: mesh_runtime::Clock, cancel: CancellationToken) -> Self {
        let next_period_millis = AtomicU64::new(state.config.timer_period.as_millis() as u64);
        Self { state, clock, cancel, next_period_millis }
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    pub fn debug_view(&self) -> ProxyDebugView {
        ProxyDebugView {
            connected_channels: self.state.connected_channel_ids().len(),
            tracked_peers: self.state.tracked_peer_count(),
            peers_pending_prune: self.state.prune_state_len(),
            small_blocks_outstanding: self.state.small_blocks.outstanding(),
        }
    }

    /// One tick of the timer cycle (§4.E.3). Returns the period the next
    /// tick should be scheduled after: the configured steady-state period,
    /// or the shortened back-pressure period if the small-block pool ran
    /// dry while issuing associates this round.
    pub async fn timer_cycle(&self) -> Duration {
        if self.state.recompute_channels_state() {
            tracing::debug!(target: "mesh::proxy", "connected channel set changed");
        }

        if self.state.block_clients().iter().all(|d| !d.is_connected()) && !self.state.block_clients().is_empty() {
            tracing::warn!(target: "mesh::proxy", "disconnected from the real broker, requesting shutdown");
            self.cancel.cancel();
            return self.state.config.timer_period;
        }

        let connected = self.state.connected_channel_ids();
        let mut back_pressure = false;
        for peer in self.state.known_peers() {
            let missing = self.state.reconcile_peer_channels(peer, &connected);
            for channel_id in missing {
                let Some(dispatch) = self.state.dispatch_for_channel(channel_id) else { continue };
                let Some(_reservation) = self.state.small_blocks.try_alloc() else {
                    back_pressure = true;
                    break;
                };
                if let Err(e) = associate(&self.state, &dispatch, channel_id, peer).await {
                    tracing::warn!(target: "mesh::proxy", peer = %peer, %channel_id, error = %e, "internal associate task failed");
                }
            }
            if back_pressure {
                break;
            }
        }

        let stale = self.state.prune_stale_clients(self.clock.now());
        if !stale.is_empty() {
            tracing::debug!(target: "mesh::proxy", count = stale.len(), "pruned stale clients");
        }

        let next = if back_pressure { self.state.config.back_pressure_period } else { self.state.config.timer_period };
        self.next_period_millis.store(next.as_millis() as u64, Ordering::Relaxed);
        next
    }

    /// `createBackendProcessingTask` (§4.E.4).
    pub async fn create_backend_processing_task(
        &self,
        resolved_source_peer_id: PeerId,
        resolved_target_peer_id: PeerId,
        block: DataBlock,
    ) -> Result<(), MeshError> {
        let block = rewrite_envelope_peer_ids(block, resolved_source_peer_id, resolved_target_peer_id)?;

        let dispatch = self
            .state
            .rotating_dispatch()
            .pick()
            .ok_or_else(|| MeshError::server(ErrorCode::NotConnected, "no connected dispatch to the real broker"))?;

        if self.state.is_known_client(resolved_target_peer_id)
            && !self.state.is_channel_configured(resolved_target_peer_id, dispatch.channel_id())
        {
            associate(&self.state, &dispatch, dispatch.channel_id(), resolved_target_peer_id).await?;
        }

        dispatch.push_block(resolved_target_peer_id, block).await
    }

    /// §4.E.5: a fresh connection invalidates every associate the proxy
    /// previously sent for this peer, since the real broker has no memory
    /// of which channel used to carry it.
    pub fn peer_connected_notify(&self, peer: PeerId) {
        self.state.mark_peer_active(peer);
        self.state.reset_configured_channels(peer);
    }

    /// Drops `peer` from the live active-connection set; no further action.
    /// The pruner picks up the resulting staleness on its own schedule.
    pub fn peer_disconnected_notify(&self, peer: PeerId) {
        self.state.mark_peer_inactive(peer);
    }
}

fn rewrite_envelope_peer_ids(
    block: DataBlock,
    source_peer_id: PeerId,
    target_peer_id: PeerId,
) -> Result<DataBlock, MeshError> {
    let offset1 = block.offset1;
    let (payload, protocol_bytes) = block.split_at_offset1();
    let mut message: BrokerProtocolMessage = BrokerProtocolMessage::from_json(protocol_bytes)?;
    validate_envelope(&message)?;

    let mut changed = false;
    if message.source_peer_id.is_nil() {
        message.source_peer_id = source_peer_id;
        changed = true;
    }
    if message.target_peer_id.is_nil() {
        message.target_peer_id = target_peer_id;
        changed = true;
    }
    if !changed {
        return Ok(block);
    }

    let payload = payload.to_vec();
    let new_protocol = message.to_packed_json()?;
    if payload.len() + new_protocol.len() > block.capacity() {
        return Err(MeshError::server(
            ErrorCode::ProtocolValidationFailed,
            "rewritten broker-protocol envelope does not fit the block's capacity",
        ));
    }
    let mut rebuilt = DataBlock::with_capacity(block.capacity());
    rebuilt.extend_from_slice(&payload);
    rebuilt.extend_from_slice(&new_protocol);
    rebuilt.offset1 = offset1;
    Ok(rebuilt)
}

/// Actor wiring: `started()` launches the self-rescheduling timer cycle.
pub struct ProxyActor {
    backend: Arc<ProxyBackend>,
}

impl ProxyActor {
    pub fn new(backend: Arc<ProxyBackend>) -> Self {
        Self { backend }
    }
}

impl actix::Actor for ProxyActor {
    type Context = actix::Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        proxy_timer_trigger(self, ctx);
    }
}

/// Runs one tick, then reschedules itself after whatever period the
/// *previous* tick decided on (steady-state or back-pressure-shortened).
fn proxy_timer_trigger(act: &mut ProxyActor, ctx: &mut actix::Context<ProxyActor>) {
    let backend = act.backend.clone();
    let period = Duration::from_millis(backend.next_period_millis.load(Ordering::Relaxed));
    ctx.spawn(wrap_future(async move {
        backend.timer_cycle().await;
    }));
    ctx.run_later(period, proxy_timer_trigger);
}
