//! The byte-framed TCP/TLS connection task (§4.A): resolve, connect/accept,
//! optional TLS handshake, framed read/write, forceful cancellation.

mod connection;
mod endpoint;
mod stats;
mod stream;
pub mod tls;

pub use connection::{BackoffConfig, Connection, TlsMode};
pub use endpoint::{expand, Endpoint};
pub use stats::{ConnectionStats, ConnectionStatsSnapshot};
