//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p realm_server -- [--config server.json] [--addr 0.0.0.0] [--port 3000]
//!       [--transport manual|rooms] [--codec json|binary]
//!       [--worlds one_for_each|at_least_one|unassigned]
//!       [--broadcast interval_push|request_reply] [--world <id>]...
//!
//! `PORT` in the environment overrides the config file; flags override both.
//!
//! Console commands:
//!   status            - Show users and worlds
//!   worlds            - List worlds with map and scenario
//!   kick <id>         - Close a connection
//!   create <worldId>  - Create an empty world
//!   quit              - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::{bail, Context};
use realm_server::RealmServer;
use realm_shared::config::{BroadcastMode, Codec, ServerConfig, TransportKind, WorldCreation};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Parses a snake_case enum value the same way the config file does.
fn parse_choice<T: DeserializeOwned>(flag: &str, value: &str) -> anyhow::Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("invalid value for {flag}: {value}"))
}

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().skip(1).collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            ServerConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?
        }
        None => ServerConfig::default(),
    };

    if let Ok(port) = env::var("PORT") {
        cfg.port = port.parse().with_context(|| format!("invalid PORT: {port}"))?;
    }

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let Some(value) = args.get(i + 1) else {
            bail!("{flag} needs a value");
        };
        match flag {
            "--config" => {}
            "--addr" => cfg.bind_addr = value.clone(),
            "--port" => cfg.port = value.parse().with_context(|| format!("invalid port: {value}"))?,
            "--transport" => cfg.transport = parse_choice::<TransportKind>(flag, value)?,
            "--codec" => cfg.codec = parse_choice::<Codec>(flag, value)?,
            "--worlds" => cfg.world_creation = parse_choice::<WorldCreation>(flag, value)?,
            "--broadcast" => cfg.broadcast = parse_choice::<BroadcastMode>(flag, value)?,
            "--world" => cfg.worlds.push(value.clone()),
            other => bail!("unknown flag: {other}"),
        }
        i += 2;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        addr = %cfg.listen_addr(),
        transport = ?cfg.transport,
        worlds = ?cfg.world_creation,
        "Starting server"
    );

    let server = RealmServer::bind(cfg).await.context("bind server")?;
    let handle = server.spawn()?;
    info!(local = %handle.local_addr(), "Server listening");

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

    println!("Server ready. Type 'status' for info, 'worlds' to list worlds, 'quit' to exit.");
    println!();

    loop {
        tokio::select! {
            line = console_rx.recv() => {
                let Some(line) = line else {
                    // stdin closed; keep serving until interrupted.
                    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
                    break;
                };
                if line == "quit" {
                    break;
                }
                match handle.console(&line).await {
                    Ok(output) => {
                        for out in output {
                            println!("{out}");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "console command failed");
                        break;
                    }
                }
            }
            res = tokio::signal::ctrl_c() => {
                res.context("wait for ctrl-c")?;
                break;
            }
        }
    }

    handle.shutdown().await
}
