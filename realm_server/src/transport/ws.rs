//! WebSocket listener.
//!
//! One task per accepted socket: the read half forwards frames to the hub,
//! a send task drains the connection's outbox into the write half. Neither
//! touches session state.

use std::net::SocketAddr;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use realm_shared::{codec::Frame, config::TransportKind};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::allocate_connection_id;
use crate::hub::HubEvent;

/// Outbox capacity per connection.
pub const OUTBOX_DEPTH: usize = 256;

/// Accepts connections until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    kind: TransportKind,
    events: mpsc::Sender<HubEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted.context("tcp accept")?,
        };
        let events = events.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, kind, events, cancel).await {
                debug!(%peer, error = %e, "connection ended with error");
            }
        });
    }
    info!("listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    kind: TransportKind,
    events: mpsc::Sender<HubEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await.context("websocket handshake")?;
    let (mut sink, mut source) = ws.split();

    let connection = allocate_connection_id(kind);
    let (outbox, mut rx) = mpsc::channel::<Frame>(OUTBOX_DEPTH);
    events
        .send(HubEvent::Connected {
            connection: connection.clone(),
            outbox,
        })
        .await
        .context("hub gone")?;
    debug!(connection = %connection, %peer, "socket accepted");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let (msg, closing) = to_message(frame);
            if sink.send(msg).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = source.next() => msg,
        };
        let frame = match msg {
            Some(Ok(Message::Text(text))) => Frame::Text(text.to_string()),
            Some(Ok(Message::Binary(bin))) => Frame::Binary(Bytes::from(bin)),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(connection = %connection, error = %e, "socket read failed");
                break;
            }
        };
        if events
            .send(HubEvent::Frame {
                connection: connection.clone(),
                frame,
            })
            .await
            .is_err()
        {
            warn!(connection = %connection, "hub gone, dropping connection");
            break;
        }
    }

    let _ = events
        .send(HubEvent::Disconnected {
            connection: connection.clone(),
        })
        .await;
    // The send task ends once the hub drops the outbox.
    let _ = send_task.await;
    debug!(connection = %connection, "socket closed");
    Ok(())
}

fn to_message(frame: Frame) -> (Message, bool) {
    match frame {
        Frame::Text(text) => (Message::Text(text.into()), false),
        Frame::Binary(bytes) => (Message::Binary(bytes.to_vec().into()), false),
        Frame::Close { code, reason } => (
            Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
            true,
        ),
    }
}

