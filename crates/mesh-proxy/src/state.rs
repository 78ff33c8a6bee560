//! Shared proxy state (§4.E.1), guarded by `parking_lot` locks with no I/O
//! held under the lock, mirroring the teacher's `announce_accounts::Cache`
//! pattern of a single `Mutex<Inner>` around plain data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use mesh_client::{BlockDispatch, RotatingDispatch};
use mesh_ids::{ChannelId, PeerId};
use parking_lot::Mutex;

use crate::config::ProxyConfig;
use crate::pool::SmallBlockPool;

/// Per-logical-peer bookkeeping: which channels to the real broker have
/// already been told "this proxy owns this peer" via an associate message.
#[derive(Default, Clone)]
pub struct ClientState {
    pub configured_channel_ids: HashSet<ChannelId>,
}

#[derive(Default)]
struct Inner {
    channels_state: HashMap<ChannelId, Arc<dyn BlockDispatch>>,
    clients_state: HashMap<PeerId, ClientState>,
    clients_prune_state: HashMap<PeerId, Instant>,
    /// Peers presently known to have a live client connection to this
    /// proxy, maintained by the acceptor side via
    /// `peer_connected_notify`/`peer_disconnected_notify`. The pruner
    /// treats a tracked peer missing from this set as inactive.
    active_peers: HashSet<PeerId>,
}

/// All mutable proxy state, per §4.E.1. `block_clients` and `rotating` are
/// immutable for the backend's lifetime (the set of outgoing connections to
/// the real broker is fixed at construction); everything that changes on a
/// timer tick or a request lives behind `inner`.
pub struct ProxyState {
    pub peer_id: PeerId,
    pub config: ProxyConfig,
    pub small_blocks: SmallBlockPool,
    block_clients: Vec<Arc<dyn BlockDispatch>>,
    rotating: RotatingDispatch,
    inner: Mutex<Inner>,
}

impl ProxyState {
    pub fn new(peer_id: PeerId, block_clients: Vec<Arc<dyn BlockDispatch>>, config: ProxyConfig) -> Self {
        let small_blocks = SmallBlockPool::new(config.small_block_size, config.max_no_of_small_blocks);
        let rotating = RotatingDispatch::new(block_clients.clone());
        Self { peer_id, config, small_blocks, block_clients, rotating, inner: Mutex::new(Inner::default()) }
    }

    pub fn rotating_dispatch(&self) -> &RotatingDispatch {
        &self.rotating
    }

    pub fn block_clients(&self) -> &[Arc<dyn BlockDispatch>] {
        &self.block_clients
    }

    /// Step 1 of the timer cycle: recompute `channels_state` from the
    /// current set of connected block clients. Returns whether the set of
    /// connected channel ids changed since the last tick.
    pub fn recompute_channels_state(&self) -> bool {
        let mut inner = self.inner.lock();
        let previous: HashSet<ChannelId> = inner.channels_state.keys().copied().collect();
        let current: HashMap<ChannelId, Arc<dyn BlockDispatch>> = self
            .block_clients
            .iter()
            .filter(|d| d.is_connected())
            .map(|d| (d.channel_id(), d.clone()))
            .collect();
        let changed = previous != current.keys().copied().collect::<HashSet<_>>();
        inner.channels_state = current;
        changed
    }

    pub fn connected_channel_ids(&self) -> HashSet<ChannelId> {
        self.inner.lock().channels_state.keys().copied().collect()
    }

    pub fn dispatch_for_channel(&self, channel_id: ChannelId) -> Option<Arc<dyn BlockDispatch>> {
        self.inner.lock().channels_state.get(&channel_id).cloned()
    }

    pub fn is_channel_configured(&self, peer: PeerId, channel_id: ChannelId) -> bool {
        self.inner
            .lock()
            .clients_state
            .get(&peer)
            .map(|s| s.configured_channel_ids.contains(&channel_id))
            .unwrap_or(false)
    }

    pub fn mark_channel_configured(&self, peer: PeerId, channel_id: ChannelId) {
        let mut inner = self.inner.lock();
        inner.clients_state.entry(peer).or_default().configured_channel_ids.insert(channel_id);
        inner.clients_prune_state.remove(&peer);
    }

    pub fn note_observed_peer(&self, peer: PeerId) {
        let mut inner = self.inner.lock();
        inner.clients_state.entry(peer).or_default();
        inner.clients_prune_state.remove(&peer);
    }

    /// Marks `peer` as currently holding a live connection to this proxy.
    pub fn mark_peer_active(&self, peer: PeerId) {
        let mut inner = self.inner.lock();
        inner.clients_state.entry(peer).or_default();
        inner.active_peers.insert(peer);
        inner.clients_prune_state.remove(&peer);
    }

    /// Marks `peer` as no longer holding a live connection. Does not remove
    /// its tracked client state; the pruner decides when that happens.
    pub fn mark_peer_inactive(&self, peer: PeerId) {
        self.inner.lock().active_peers.remove(&peer);
    }

    pub fn is_known_client(&self, peer: PeerId) -> bool {
        self.inner.lock().clients_state.contains_key(&peer)
    }

    /// Step 3 of the timer cycle, per-peer: drop channel ids no longer
    /// connected, return the channels still missing an associate.
    pub fn reconcile_peer_channels(&self, peer: PeerId, connected: &HashSet<ChannelId>) -> Vec<ChannelId> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.clients_state.get_mut(&peer) else { return Vec::new() };
        state.configured_channel_ids.retain(|c| connected.contains(c));
        connected.iter().filter(|c| !state.configured_channel_ids.contains(c)).copied().collect()
    }

    /// On reconnect: wipe configured channels so every channel re-announces.
    pub fn reset_configured_channels(&self, peer: PeerId) {
        if let Some(state) = self.inner.lock().clients_state.get_mut(&peer) {
            state.configured_channel_ids.clear();
        }
    }

    /// Step 4: mark tracked peers absent from the live active-connection set
    /// as inactive, and return the ones that have now been inactive longer
    /// than `prune_interval`.
    pub fn prune_stale_clients(&self, now: Instant) -> Vec<PeerId> {
        let mut inner = self.inner.lock();
        let tracked: Vec<PeerId> = inner.clients_state.keys().copied().collect();
        for peer in &tracked {
            if inner.active_peers.contains(peer) {
                inner.clients_prune_state.remove(peer);
            } else {
                inner.clients_prune_state.entry(*peer).or_insert(now);
            }
        }
        let prune_interval = self.config.prune_interval;
        let stale: Vec<PeerId> = inner
            .clients_prune_state
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= prune_interval)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &stale {
            inner.clients_state.remove(peer);
            inner.clients_prune_state.remove(peer);
        }
        stale
    }

    pub fn tracked_peer_count(&self) -> usize {
        self.inner.lock().clients_state.len()
    }

    pub fn prune_state_len(&self) -> usize {
        self.inner.lock().clients_prune_state.len()
    }

    pub fn configured_channel_ids(&self, peer: PeerId) -> HashSet<ChannelId> {
        self.inner.lock().clients_state.get(&peer).map(|s| s.configured_channel_ids.clone()).unwrap_or_default()
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.inner.lock().clients_state.keys().copied().collect()
    }
}
