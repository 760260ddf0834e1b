//! Socket-level integration tests: real server, real clients, both transports.

use std::time::{Duration, Instant};

use realm_client::input::enter_vehicle;
use realm_server::LifecycleEvent;
use realm_shared::{
    config::{BroadcastMode, Codec, ServerConfig, TransportKind, WorldCreation},
    ids::WorldId,
    protocol::ServerEvent,
    snapshot::SnapshotRecord,
};
use realm_tests::{wait_lifecycle, TestServer, WAIT};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_client_gets_dedicated_world_and_state() -> anyhow::Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut client = server.confirmed_client().await?;

    assert!(client.connection_id.as_str().starts_with("soc_"));
    assert_eq!(
        client.assigned_world,
        Some(WorldId::for_connection(&client.connection_id))
    );

    let user = client.user_id.clone();
    let pushed = client
        .wait_for(WAIT, |e| match e {
            ServerEvent::StateUpdate(snap) => snap.user_ids().contains(&user),
            _ => false,
        })
        .await?;
    assert!(pushed.is_some(), "expected a state push naming the player");

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rooms_clients_share_the_first_world() -> anyhow::Result<()> {
    let server = TestServer::start(ServerConfig {
        transport: TransportKind::Rooms,
        world_creation: WorldCreation::AtLeastOne,
        ..ServerConfig::default()
    })
    .await?;

    let mut a = server.confirmed_client().await?;
    let b = server.confirmed_client().await?;
    assert_eq!(a.connection_id.as_str().len(), 20);
    assert_eq!(a.assigned_world, b.assigned_world);

    let b_id = b.connection_id.clone();
    let added = a
        .wait_for(WAIT, |e| {
            matches!(e, ServerEvent::AddClient(peer) if peer.connection_id == b_id)
        })
        .await?;
    match added {
        Some(ServerEvent::AddClient(peer)) => assert_eq!(peer.user_id, b.user_id),
        other => panic!("expected addClient, got {other:?}"),
    }

    b.close().await?;
    let removed = a
        .wait_for(WAIT, |e| {
            matches!(e, ServerEvent::RemoveClient { connection_id } if *connection_id == b_id)
        })
        .await?;
    assert!(removed.is_some());

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn change_world_then_chat() -> anyhow::Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut lifecycle = server.handle.subscribe();
    let mut a = server.confirmed_client().await?;
    let mut b = server.confirmed_client().await?;
    let a_world = a.assigned_world.clone().unwrap();
    let b_world = b.assigned_world.clone().unwrap();

    let reply = a.enter_world(&b_world).await?;
    assert_eq!(reply.world_id, b_world);
    assert_eq!(reply.last_map_id.as_deref(), Some("sandbox"));
    assert_eq!(reply.players.len(), 1);
    assert_eq!(reply.players[0].connection_id, b.connection_id);

    // a's dedicated world is collected once it is empty.
    wait_lifecycle(&mut lifecycle, WAIT, |e| {
        matches!(e, LifecycleEvent::WorldRemoved { world_id } if *world_id == a_world)
    })
    .await?;

    a.chat("hello there").await?;
    let chat = b
        .wait_for(WAIT, |e| matches!(e, ServerEvent::ChatMessage(_)))
        .await?;
    match chat {
        Some(ServerEvent::ChatMessage(msg)) => {
            assert_eq!(msg.user_id, a.user_id);
            assert_eq!(msg.message, "hello there");
        }
        other => panic!("expected chat, got {other:?}"),
    }

    a.set_map("test2").await?;
    let changed = b
        .wait_for(WAIT, |e| matches!(e, ServerEvent::MapChanged { map } if map == "test2"))
        .await?;
    assert!(changed.is_some());

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_codec_request_reply_snapshots() -> anyhow::Result<()> {
    let server = TestServer::start(ServerConfig {
        codec: Codec::Binary,
        broadcast: BroadcastMode::RequestReply,
        ..ServerConfig::default()
    })
    .await?;
    let mut client = server.confirmed_client().await?;
    let world = client.assigned_world.clone().unwrap();

    let snap = client.update(Some(12.0)).await?.expect("snapshot reply");
    assert!(matches!(snap.get(world.as_str()), Some(SnapshotRecord::World(_))));
    match snap.get(client.connection_id.as_str()) {
        Some(SnapshotRecord::Player(p)) => {
            assert_eq!(p.user_id, client.user_id);
            assert_eq!(p.world_id.as_ref(), Some(&world));
        }
        other => panic!("expected player record, got {other:?}"),
    }
    // Nothing is pushed in this mode.
    let pushed = client
        .wait_for(Duration::from_millis(300), |e| {
            matches!(e, ServerEvent::StateUpdate(_))
        })
        .await?;
    assert!(pushed.is_none());

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unassigned_players_join_and_leave() -> anyhow::Result<()> {
    let server = TestServer::start(ServerConfig {
        world_creation: WorldCreation::Unassigned,
        worlds: vec!["World_main".into()],
        ..ServerConfig::default()
    })
    .await?;
    let mut client = server.confirmed_client().await?;
    assert_eq!(client.assigned_world, None);

    let main = WorldId::new("World_main");
    let reply = client.enter_world(&main).await?;
    assert!(reply.players.is_empty());

    let left = client.leave_world().await?;
    assert_eq!(left.world_id, None);

    // Unknown targets get no answer at all.
    client.set_request_timeout(Duration::from_millis(300));
    assert!(client.change_world(&WorldId::new("World_nowhere")).await.is_err());

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn driver_disconnect_waits_for_vehicle_exit() -> anyhow::Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut lifecycle = server.handle.subscribe();
    let mut client = server.confirmed_client().await?;
    let world = client.assigned_world.clone().unwrap();
    let id = client.connection_id.clone();
    let user = client.user_id.clone();

    client.change_world_finish(&world).await?;
    client.controls(enter_vehicle(None)).await?;
    let driving = client
        .wait_for(WAIT, |e| match e {
            ServerEvent::StateUpdate(snap) => snap
                .entities()
                .any(|e| e.id.starts_with("vehicle_") && e.controlled_by.as_ref() == Some(&user)),
            _ => false,
        })
        .await?;
    assert!(driving.is_some(), "character never boarded the vehicle");

    let closed_at = Instant::now();
    client.close().await?;
    wait_lifecycle(&mut lifecycle, Duration::from_secs(6), |e| {
        matches!(e, LifecycleEvent::Disconnected { connection_id } if *connection_id == id)
    })
    .await?;
    let held = closed_at.elapsed();
    // Released after the exit animation, well before the grace deadline.
    assert!(held >= Duration::from_millis(400), "removed too early: {held:?}");
    assert!(held < Duration::from_millis(4_500), "grace ran to the deadline: {held:?}");

    server.shutdown().await
}
