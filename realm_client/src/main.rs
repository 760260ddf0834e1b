//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p realm_client -- [--url ws://127.0.0.1:3000] [--transport manual|rooms]
//!       [--codec json|binary] [--world <id>] [--wander]
//!
//! The client connects, completes the identity handshake, heartbeats every
//! 100 ms and prints what the server pushes.
//!
//! Console commands:
//!   status              - Show client status
//!   join <worldId>      - Change world
//!   leave               - Leave the current world
//!   map <mapname>       - Switch the world's map
//!   scenario <name>     - Switch the world's scenario
//!   say <message>       - Send chat message
//!   enter [vehicleId]   - Board a vehicle
//!   exit                - Leave the vehicle
//!   quit                - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::{bail, Context};
use realm_client::{
    input::{build_controls, enter_vehicle, exit_vehicle, InputState},
    ClientState, RealmClient,
};
use realm_shared::{
    config::{Codec, TransportKind},
    ids::WorldId,
    protocol::ServerEvent,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    url: String,
    transport: TransportKind,
    codec: Codec,
    world: Option<WorldId>,
    wander: bool,
}

fn parse_choice<T: DeserializeOwned>(flag: &str, value: &str) -> anyhow::Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("invalid value for {flag}: {value}"))
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        url: "ws://127.0.0.1:3000".into(),
        transport: TransportKind::default(),
        codec: Codec::default(),
        world: None,
        wander: false,
    };
    let argv: Vec<String> = env::args().skip(1).collect();
    let mut i = 0;
    while i < argv.len() {
        let flag = argv[i].as_str();
        if flag == "--wander" {
            args.wander = true;
            i += 1;
            continue;
        }
        let Some(value) = argv.get(i + 1) else {
            bail!("{flag} needs a value");
        };
        match flag {
            "--url" => args.url = value.clone(),
            "--transport" => args.transport = parse_choice(flag, value)?,
            "--codec" => args.codec = parse_choice(flag, value)?,
            "--world" => args.world = Some(WorldId::new(value.as_str())),
            other => bail!("unknown flag: {other}"),
        }
        i += 2;
    }
    Ok(args)
}

async fn exec_console(client: &mut RealmClient, line: &str) -> anyhow::Result<Vec<String>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(command) = tokens.first() else {
        return Ok(Vec::new());
    };
    match *command {
        "status" => Ok(vec![
            format!("State: {:?}", client.state),
            format!("Connection: {}", client.connection_id),
            format!("User: {}", client.user_id),
            format!("Snapshots buffered: {}", client.snaps.len()),
        ]),
        "join" => {
            let Some(world) = tokens.get(1) else {
                return Ok(vec!["Usage: join <worldId>".to_string()]);
            };
            let reply = client.enter_world(&WorldId::new(*world)).await?;
            Ok(vec![format!(
                "Joined {} ({} players, map {})",
                reply.world_id,
                reply.players.len(),
                reply.last_map_id.unwrap_or_else(|| "-".into())
            )])
        }
        "leave" => {
            client.leave_world().await?;
            Ok(vec!["Left world".to_string()])
        }
        "map" | "scenario" => {
            let Some(name) = tokens.get(1) else {
                return Ok(vec![format!("Usage: {command} <name>")]);
            };
            if *command == "map" {
                client.set_map(name).await?;
            } else {
                client.set_scenario(name).await?;
            }
            Ok(vec![])
        }
        "say" => {
            client.chat(&tokens[1..].join(" ")).await?;
            Ok(vec![])
        }
        "enter" => {
            client.controls(enter_vehicle(tokens.get(1).copied())).await?;
            Ok(vec![])
        }
        "exit" => {
            client.controls(exit_vehicle()).await?;
            Ok(vec![])
        }
        other => Ok(vec![format!("Unknown command: {other}")]),
    }
}

fn describe(event: &ServerEvent) -> Option<String> {
    match event {
        ServerEvent::AddClient(peer) => Some(format!("+ {} ({})", peer.user_id, peer.connection_id)),
        ServerEvent::RemoveClient { connection_id } => Some(format!("- {connection_id}")),
        ServerEvent::MapChanged { map } => Some(format!("map -> {map}")),
        ServerEvent::ScenarioChanged { scenario } => Some(format!("scenario -> {scenario}")),
        ServerEvent::ChatMessage(chat) => Some(format!("<{}> {}", chat.user_id, chat.message)),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let mut client = RealmClient::connect(&args.url, args.transport, args.codec)
        .await
        .context("connect")?;

    if let Some(world) = &args.world {
        let reply = client.enter_world(world).await?;
        info!(world = %reply.world_id, players = reply.players.len(), "Joined world");
    }

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut heartbeat = tokio::time::interval(Duration::from_millis(100));
    let mut beats: u64 = 0;
    loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                return client.close().await;
            }
            match exec_console(&mut client, &line).await {
                Ok(output) => {
                    for out in output {
                        println!("{out}");
                    }
                }
                Err(e) => println!("Error: {e}"),
            }
        }

        heartbeat.tick().await;
        beats += 1;
        if let Err(e) = client.update(None).await {
            warn!(error = %e, "heartbeat failed");
        }
        if args.wander {
            // Walk a slow square.
            let phase = (beats / 20) % 4;
            let input = match phase {
                0 => InputState { forward: 1.0, right: 0.0 },
                1 => InputState { forward: 0.0, right: 1.0 },
                2 => InputState { forward: -1.0, right: 0.0 },
                _ => InputState { forward: 0.0, right: -1.0 },
            };
            client.controls(build_controls(input)).await?;
        }

        while let Some(event) = client.next_event(Duration::ZERO).await? {
            if let Some(line) = describe(&event) {
                println!("{line}");
            }
        }
        if let ClientState::Closed { code, reason } = &client.state {
            println!("Disconnected from server ({code} {reason}).");
            break;
        }
        if beats % 50 == 0 {
            if let Some(snap) = client.snaps.last_snapshot() {
                info!(records = snap.len(), users = snap.user_ids().len(), "Snapshot");
            }
        }
    }

    Ok(())
}
