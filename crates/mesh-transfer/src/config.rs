//! Shared configuration for the chunk pipeline units (§4.F): chunk size,
//! connection pool width, and the scan/unpack batch size, plus the
//! send/recv context every stage is handed.

use std::sync::Arc;

use mesh_runtime::CancellationToken;

use crate::pool::ClientPool;

/// Size a file's content is split into for transfer. Implementation-defined
/// per spec.md §4.F.2; 4 MiB balances per-chunk overhead against how much of
/// a partial write is lost on a retry.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// How the scanner consults a caller-provided skip predicate, per
/// §4.F.1 ("honours a scan-control token so certain paths can be skipped").
pub trait ScanControl: Send + Sync {
    fn should_skip(&self, rel_path: &str) -> bool;
}

/// Default scan-control token that never skips anything.
pub struct ScanEverything;

impl ScanControl for ScanEverything {
    fn should_skip(&self, _rel_path: &str) -> bool {
        false
    }
}

/// On non-UNIX targets, how the unpackager's symlink worker should react to
/// an entry it cannot represent natively (§4.F.5).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WindowsSymlinkPolicy {
    Error,
    WarnAndIgnore,
    WarnAndCreateFile,
    SilentIgnore,
    SilentCreateFile,
}

#[derive(Clone, Debug)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Batch size the scanner accumulates before sending a batch downstream.
    pub scan_batch_size: usize,
    /// Size of the bounded queues between pipeline stages.
    pub queue_capacity: usize,
    pub windows_symlink_policy: WindowsSymlinkPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            scan_batch_size: 64,
            queue_capacity: 32,
            windows_symlink_policy: WindowsSymlinkPolicy::WarnAndIgnore,
        }
    }
}

/// The common send/recv context every transmitter/receiver stage shares
/// (§4.F preamble): which block-transfer client pool to use, and whether the
/// stream should be marked peer-session-tracking so a failure can
/// `FlushPeerSessions` on the way out.
pub struct TransferContext {
    pub pool: Arc<ClientPool>,
    pub peer_session_tracking: bool,
    pub cancel: CancellationToken,
}

impl TransferContext {
    pub fn new(pool: Arc<ClientPool>, cancel: CancellationToken) -> Self {
        Self { pool, peer_session_tracking: false, cancel }
    }

    pub fn with_peer_session_tracking(mut self, enabled: bool) -> Self {
        self.peer_session_tracking = enabled;
        self
    }
}
