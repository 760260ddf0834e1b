//! `realm_server`
//!
//! Multiplayer world session server:
//! - Connection registry with identity handshake and disconnect grace
//! - World registry with per-world tick and chat log
//! - Two transports (rooms, manual envelopes) over WebSocket
//!
//! Concurrency model:
//! - One hub task owns all session state and applies events in order
//! - Socket readers, timers and the console only post `HubEvent`s

pub mod hub;
pub mod players;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod worlds;

#[cfg(test)]
pub(crate) mod testing;

pub use server::{bind_ephemeral, RealmServer, ServerHandle};
pub use session::LifecycleEvent;
