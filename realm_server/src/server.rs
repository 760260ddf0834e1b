//! Server assembly.
//!
//! Binds the listener, builds the session and its transport, and starts the
//! two long-lived tasks: the hub (owns all state) and the accept loop (owns
//! nothing). `ServerHandle` is how the binary and the tests steer it.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use realm_shared::{config::ServerConfig, sandbox::SandboxFactory, sim::WorldFactory};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    hub::{Hub, HubEvent},
    session::{LifecycleEvent, Session, LIFECYCLE_CAPACITY},
    transport::{self, ws},
};

/// A bound, not yet running server.
pub struct RealmServer {
    cfg: ServerConfig,
    listener: TcpListener,
    factory: Arc<dyn WorldFactory>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl RealmServer {
    /// Binds `cfg.listen_addr()` with the sandbox simulation.
    pub async fn bind(cfg: ServerConfig) -> anyhow::Result<Self> {
        Self::bind_with(cfg, Arc::new(SandboxFactory)).await
    }

    pub async fn bind_with(cfg: ServerConfig, factory: Arc<dyn WorldFactory>) -> anyhow::Result<Self> {
        let addr = cfg.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Ok(Self {
            cfg,
            listener,
            factory,
            lifecycle,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("local_addr")
    }

    /// Subscribes before `spawn` so no startup event is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Starts the hub and the accept loop.
    pub fn spawn(self) -> anyhow::Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (events, inbox) = mpsc::channel(self.cfg.queue_depth.max(1));
        let kind = self.cfg.transport;
        info!(
            addr = %local_addr,
            transport = ?kind,
            codec = ?self.cfg.codec,
            world_creation = ?self.cfg.world_creation,
            broadcast = ?self.cfg.broadcast,
            "server listening"
        );

        let session = Session::new(
            self.cfg.clone(),
            transport::for_config(&self.cfg),
            self.factory,
            events.clone(),
            self.lifecycle.clone(),
        );
        let hub = tokio::spawn(Hub::new(session, inbox).run());

        let cancel = CancellationToken::new();
        let listener = tokio::spawn(ws::serve(self.listener, kind, events.clone(), cancel.clone()));

        Ok(ServerHandle {
            local_addr,
            events,
            lifecycle: self.lifecycle,
            cancel,
            hub,
            listener,
        })
    }
}

/// Control surface of a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    events: mpsc::Sender<HubEvent>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    cancel: CancellationToken,
    hub: JoinHandle<()>,
    listener: JoinHandle<anyhow::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Runs one operator console line and returns its output.
    pub async fn console(&self, line: &str) -> anyhow::Result<Vec<String>> {
        let (reply, answer) = oneshot::channel();
        self.events
            .send(HubEvent::Console {
                line: line.to_string(),
                reply,
            })
            .await
            .context("hub stopped")?;
        answer.await.context("console reply dropped")
    }

    /// Closes every client, stops the hub, then stops accepting.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        if self.events.send(HubEvent::Shutdown).await.is_err() {
            warn!("hub already stopped");
        }
        self.hub.await.context("join hub")?;
        self.cancel.cancel();
        self.listener.await.context("join listener")??;
        info!("server stopped");
        Ok(())
    }
}

/// Binds `cfg` on an ephemeral loopback port. Used by tests.
pub async fn bind_ephemeral(cfg: ServerConfig) -> anyhow::Result<RealmServer> {
    RealmServer::bind(ServerConfig {
        bind_addr: "127.0.0.1".into(),
        port: 0,
        ..cfg
    })
    .await
}
