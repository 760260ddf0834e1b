//! Identifiers.
//!
//! Connection, user and world identities are plain strings on the wire. The
//! newtypes keep them from being mixed up inside the server.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

static NEXT_MANUAL_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Prefix of server-generated connection ids (manual transport).
pub const MANUAL_CONNECTION_PREFIX: &str = "soc_";

/// Prefix of world ids derived from the creating connection.
pub const WORLD_ID_PREFIX: &str = "World_";

/// Identifies one live socket session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    /// Allocates the next `soc_<n>` id from the process-wide counter.
    pub fn next_manual() -> Self {
        let n = NEXT_MANUAL_CONNECTION.fetch_add(1, Ordering::Relaxed);
        ConnectionId(format!("{MANUAL_CONNECTION_PREFIX}{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical player id, confirmed by the client after the identity round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    /// The id a client derives from the sequence counter it was handed.
    pub fn from_sequence(sequence: u64) -> Self {
        UserId(format!("user_{sequence}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a world instance and its broadcast group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldId(pub String);

impl WorldId {
    pub fn new(id: impl Into<String>) -> Self {
        WorldId(id.into())
    }

    /// Deterministic world id for a world created on behalf of a connection.
    pub fn for_connection(connection: &ConnectionId) -> Self {
        WorldId(format!("{WORLD_ID_PREFIX}{connection}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_ids_are_prefixed_and_unique() {
        let a = ConnectionId::next_manual();
        let b = ConnectionId::next_manual();
        assert!(a.as_str().starts_with("soc_"));
        assert_ne!(a, b);
    }

    #[test]
    fn world_id_derives_from_connection() {
        let conn = ConnectionId::new("soc_7");
        assert_eq!(WorldId::for_connection(&conn).as_str(), "World_soc_7");
    }
}
