//! Helpers shared by the integration tests: tracing setup, an in-process
//! server on an ephemeral port, and lifecycle waits.

use std::time::Duration;

use anyhow::Context;
use realm_client::RealmClient;
use realm_server::{bind_ephemeral, LifecycleEvent, ServerHandle};
use realm_shared::config::ServerConfig;
use tokio::sync::broadcast;

/// Default wait for anything the server should do promptly.
pub const WAIT: Duration = Duration::from_secs(3);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A running server plus the `ws://` url clients should use.
pub struct TestServer {
    pub handle: ServerHandle,
    pub url: String,
    pub cfg: ServerConfig,
}

impl TestServer {
    pub async fn start(cfg: ServerConfig) -> anyhow::Result<Self> {
        init_tracing();
        let server = bind_ephemeral(cfg.clone()).await?;
        let handle = server.spawn()?;
        let url = format!("ws://{}", handle.local_addr());
        Ok(Self { handle, url, cfg })
    }

    pub async fn client(&self) -> anyhow::Result<RealmClient> {
        RealmClient::connect(&self.url, self.cfg.transport, self.cfg.codec).await
    }

    /// Connects and waits until the server has applied the identity
    /// confirmation, using an `update` round trip on the same socket.
    pub async fn confirmed_client(&self) -> anyhow::Result<RealmClient> {
        let mut client = self.client().await?;
        client.update(None).await.context("first heartbeat")?;
        Ok(client)
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.handle.shutdown().await
    }
}

/// Waits for the first lifecycle event matching `pred`.
pub async fn wait_lifecycle<F>(
    rx: &mut broadcast::Receiver<LifecycleEvent>,
    timeout: Duration,
    mut pred: F,
) -> anyhow::Result<LifecycleEvent>
where
    F: FnMut(&LifecycleEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("lifecycle channel closed")
                }
            }
        }
    })
    .await
    .context("timed out waiting for lifecycle event")?
}
