//! `realm_client`
//!
//! Headless client for the session server:
//! - WebSocket connection over either transport
//! - Identity handshake and correlated requests
//! - Movement input as `move` controls
//! - Interpolation over buffered snapshots

pub mod client;
pub mod input;
pub mod interp;

pub use client::{ClientState, RealmClient};
