//! Hub actor.
//!
//! The single task that owns the `Session`. Sockets, timers and the console
//! all talk to it through one bounded inbox; it applies events strictly in
//! arrival order. A panic inside a handler is caught here so the listener
//! and every other connection keep running.

use std::panic::{self, AssertUnwindSafe};

use realm_shared::{codec::Frame, ids::ConnectionId, ids::WorldId};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::session::Session;

#[derive(Debug)]
pub enum HubEvent {
    Connected {
        connection: ConnectionId,
        outbox: mpsc::Sender<Frame>,
    },
    Disconnected {
        connection: ConnectionId,
    },
    Frame {
        connection: ConnectionId,
        frame: Frame,
    },
    WorldTick {
        world: WorldId,
        generation: u64,
    },
    LobbyTick,
    GraceExpired(ConnectionId),
    Console {
        line: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

impl HubEvent {
    fn label(&self) -> &'static str {
        match self {
            HubEvent::Connected { .. } => "connected",
            HubEvent::Disconnected { .. } => "disconnected",
            HubEvent::Frame { .. } => "frame",
            HubEvent::WorldTick { .. } => "world_tick",
            HubEvent::LobbyTick => "lobby_tick",
            HubEvent::GraceExpired(_) => "grace_expired",
            HubEvent::Console { .. } => "console",
            HubEvent::Shutdown => "shutdown",
        }
    }
}

pub struct Hub {
    session: Session,
    inbox: mpsc::Receiver<HubEvent>,
}

impl Hub {
    pub fn new(session: Session, inbox: mpsc::Receiver<HubEvent>) -> Self {
        Self { session, inbox }
    }

    /// Runs until `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.inbox.recv().await {
            let stop = matches!(event, HubEvent::Shutdown);
            let label = event.label();
            let session = &mut self.session;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| session.handle(event)));
            if let Err(payload) = outcome {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(event = label, panic = %message, "handler panicked");
            }
            if stop {
                break;
            }
        }
        info!("hub stopped");
    }
}
