//! The block-transfer protocol engine (§4.B): the server-side state machine
//! driven off a wire connection, plus the authentication policy seam it
//! dispatches through.

mod auth;
mod client;
mod server;
mod server_loop;

pub use auth::{AuthPolicy, NoAuth};
pub use client::ClientSession;
pub use server::{Request, Response, ServerEngineConfig, ServerSession};
pub use server_loop::run_server_connection;
