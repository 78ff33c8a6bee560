//! The chunk pipeline (§4.F): scanner, packager, transmitter, receiver,
//! unpackager, and deleter units, connected by bounded queues, that turn a
//! directory tree into a metadata artifact plus a set of content-addressed
//! chunks on the wire, and back again.
//!
//! Upload direction: `scanner -> packager -> transmitter -> block-transfer
//! server`. Download direction reverses it: `block-transfer server ->
//! receiver -> unpackager -> filesystem`. Every stage is handed the same
//! [`TransferContext`] so they all go through one [`ClientPool`].

pub mod chunk_block;
pub mod config;
pub mod deleter;
pub mod packager;
pub mod pool;
pub mod receiver;
pub mod scanner;
pub mod transmitter;
pub mod unpackager;

pub use chunk_block::DataChunkBlock;
pub use config::{ScanControl, ScanEverything, TransferConfig, TransferContext, WindowsSymlinkPolicy, DEFAULT_CHUNK_SIZE};
pub use pool::ClientPool;
