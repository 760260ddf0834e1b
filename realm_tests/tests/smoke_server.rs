//! Smoke tests: the server starts, answers its console and shuts down cleanly.

use std::time::Duration;

use realm_client::ClientState;
use realm_server::LifecycleEvent;
use realm_shared::config::{ServerConfig, WorldCreation};
use realm_tests::{wait_lifecycle, TestServer, WAIT};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn console_reports_startup_worlds() -> anyhow::Result<()> {
    let server = TestServer::start(ServerConfig {
        world_creation: WorldCreation::Unassigned,
        worlds: vec!["World_main".into()],
        ..ServerConfig::default()
    })
    .await?;

    let status = server.handle.console("status").await?;
    assert!(status.contains(&"Users: 0".to_string()));
    assert!(status.contains(&"Worlds: 1".to_string()));

    let created = server.handle.console("create World_extra").await?;
    assert_eq!(created, vec!["World 'World_extra' created".to_string()]);
    let again = server.handle.console("create World_extra").await?;
    assert_eq!(again, vec!["World 'World_extra' already exists".to_string()]);

    let worlds = server.handle.console("worlds").await?;
    assert_eq!(worlds[0], "Worlds: 2");
    assert!(worlds.iter().any(|l| l.contains("World_main") && l.contains("map=sandbox")));

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_closes_connected_clients() -> anyhow::Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut client = server.confirmed_client().await?;

    server.shutdown().await?;

    let deadline = tokio::time::Instant::now() + WAIT;
    while client.state == ClientState::Connected && tokio::time::Instant::now() < deadline {
        client.next_event(Duration::from_millis(100)).await?;
    }
    assert_eq!(
        client.state,
        ClientState::Closed {
            code: 4000,
            reason: "server closed".into()
        }
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kick_disconnects_the_player() -> anyhow::Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut lifecycle = server.handle.subscribe();
    let mut client = server.confirmed_client().await?;
    let id = client.connection_id.clone();

    let out = server.handle.console(&format!("kick {id}")).await?;
    assert_eq!(out, vec![format!("Kicked {id}")]);
    wait_lifecycle(&mut lifecycle, WAIT, |e| {
        matches!(e, LifecycleEvent::Disconnected { connection_id } if *connection_id == id)
    })
    .await?;

    let deadline = tokio::time::Instant::now() + WAIT;
    while client.state == ClientState::Connected && tokio::time::Instant::now() < deadline {
        client.next_event(Duration::from_millis(100)).await?;
    }
    assert!(matches!(client.state, ClientState::Closed { code: 4001, .. }));

    server.shutdown().await
}
