//! `realm_shared`
//!
//! Types shared by the session server and the headless client.
//!
//! Design goals:
//! - One definition of the wire protocol for both transports.
//! - The world simulation sits behind a trait; the sandbox is just one impl.
//! - No `unsafe`.

pub mod chat;
pub mod codec;
pub mod config;
pub mod ecs;
pub mod ids;
pub mod math;
pub mod protocol;
pub mod sandbox;
pub mod sim;
pub mod snapshot;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::{Envelope, Frame, RoomFrame};
    pub use crate::config::*;
    pub use crate::ids::*;
    pub use crate::math::*;
    pub use crate::protocol::*;
    pub use crate::sim::{WorldFactory, WorldSim};
    pub use crate::snapshot::*;
}
