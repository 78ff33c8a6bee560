use std::time::Duration;

/// Tunables for [`crate::backend::ProxyBackend`] (§4.E). Defaults match
/// spec.md's body text (`PRUNE_INTERVAL` = 60 s, checked every 20 s), which
/// overrides the arithmetic aside the same section's footnote suggests.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// How long a peer may sit absent from the active dispatcher set before
    /// it is pruned from `clients_state`.
    pub prune_interval: Duration,
    /// How often the timer cycle checks for prunable peers.
    pub prune_check_interval: Duration,
    /// Steady-state period of the associate/prune timer cycle.
    pub timer_period: Duration,
    /// Shortened period used when a tick could not allocate enough small
    /// blocks to issue every pending associate for this round.
    pub back_pressure_period: Duration,
    /// Size of one pooled associate-message block.
    pub small_block_size: usize,
    /// Hard cap on live small blocks, default `5 MiB / small_block_size`.
    pub max_no_of_small_blocks: usize,
}

const DEFAULT_SMALL_BLOCK_SIZE: usize = 4096;

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prune_interval: Duration::from_secs(60),
            prune_check_interval: Duration::from_secs(20),
            timer_period: Duration::from_secs(5),
            back_pressure_period: Duration::from_millis(100),
            small_block_size: DEFAULT_SMALL_BLOCK_SIZE,
            max_no_of_small_blocks: (5 * 1024 * 1024) / DEFAULT_SMALL_BLOCK_SIZE,
        }
    }
}
