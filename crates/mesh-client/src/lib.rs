//! The messaging client (§4.D): block/object dispatch surfaces, the adapters
//! between them, rotating dispatch with failover, and endpoint expansion
//! ([`mesh_transport::expand`], re-exported here for convenience).

mod adapters;
mod connection_dispatch;
mod dispatch;
mod rotating;

pub use adapters::{BlockFromObject, ObjectFromBlock};
pub use connection_dispatch::ConnectionBlockDispatch;
pub use dispatch::{BlockDispatch, ObjectDispatch};
pub use mesh_transport::{expand, Endpoint};
pub use rotating::{RotatingDispatch, NO_DISPATCH_AVAILABLE_PEER};
