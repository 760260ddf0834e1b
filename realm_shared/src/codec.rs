//! Frame codecs.
//!
//! Two wire shapes sit on top of WebSocket messages:
//! - Envelopes (`{type, params}`), used by the manual transport, either as
//!   JSON text or as a binary frame: `[u16 BE type length][type][params JSON]`.
//! - Room frames (`{event, data, ack}`), used by the rooms transport. A frame
//!   with `ack` but no `event` answers the request carrying that ack id.

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::Codec,
    ids::ConnectionId,
    protocol::{Command, DecodeError, ServerEvent},
};

/// Transport-agnostic socket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

/// Manual-transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    pub fn from_event(event: &ServerEvent) -> anyhow::Result<Self> {
        let (kind, params) = event.to_parts()?;
        Ok(Self { kind, params })
    }

    pub fn from_command(command: &Command, sender: &ConnectionId) -> anyhow::Result<Self> {
        let (kind, params) = command.to_parts(sender)?;
        Ok(Self { kind, params })
    }
}

pub fn encode_envelope(codec: Codec, envelope: &Envelope) -> anyhow::Result<Frame> {
    match codec {
        Codec::Json => {
            let text = serde_json::to_string(envelope).context("serialize envelope")?;
            Ok(Frame::Text(text))
        }
        Codec::Binary => {
            let params = serde_json::to_vec(&envelope.params).context("serialize params")?;
            let kind = envelope.kind.as_bytes();
            let kind_len = u16::try_from(kind.len()).context("envelope type too long")?;
            let mut buf = BytesMut::with_capacity(2 + kind.len() + params.len());
            buf.put_u16(kind_len);
            buf.put_slice(kind);
            buf.put_slice(&params);
            Ok(Frame::Binary(buf.freeze()))
        }
    }
}

/// Decodes an envelope from either frame kind, whatever codec the sender picked.
pub fn decode_envelope(frame: &Frame) -> Result<Envelope, DecodeError> {
    match frame {
        Frame::Text(text) => {
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))
        }
        Frame::Binary(bytes) => decode_binary(bytes),
        Frame::Close { .. } => Err(DecodeError::Malformed("close frame".into())),
    }
}

fn decode_binary(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let mut buf = bytes;
    if buf.remaining() < 2 {
        return Err(DecodeError::Malformed("binary frame too short".into()));
    }
    let kind_len = usize::from(buf.get_u16());
    if buf.remaining() < kind_len {
        return Err(DecodeError::Malformed("binary frame truncated".into()));
    }
    let kind = std::str::from_utf8(&buf[..kind_len])
        .map_err(|e| DecodeError::Malformed(e.to_string()))?
        .to_string();
    let rest = &buf[kind_len..];
    let params = if rest.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(rest).map_err(|e| DecodeError::Malformed(e.to_string()))?
    };
    Ok(Envelope { kind, params })
}

/// Rooms-transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl RoomFrame {
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self {
            event: Some(name.into()),
            data,
            ack: None,
        }
    }

    /// A request that expects an answer under `ack`.
    pub fn request(name: impl Into<String>, data: Value, ack: u64) -> Self {
        Self {
            event: Some(name.into()),
            data,
            ack: Some(ack),
        }
    }

    pub fn reply(ack: u64, data: Value) -> Self {
        Self {
            event: None,
            data,
            ack: Some(ack),
        }
    }

    pub fn from_event(event: &ServerEvent) -> anyhow::Result<Self> {
        let (kind, params) = event.to_parts()?;
        Ok(Self::event(kind, params))
    }

    pub fn is_reply(&self) -> bool {
        self.event.is_none() && self.ack.is_some()
    }
}

pub fn encode_room(frame: &RoomFrame) -> anyhow::Result<Frame> {
    let text = serde_json::to_string(frame).context("serialize room frame")?;
    Ok(Frame::Text(text))
}

pub fn decode_room(frame: &Frame) -> Result<RoomFrame, DecodeError> {
    let parsed = match frame {
        Frame::Text(text) => serde_json::from_str(text),
        Frame::Binary(bytes) => serde_json::from_slice(bytes),
        Frame::Close { .. } => return Err(DecodeError::Malformed("close frame".into())),
    };
    parsed.map_err(|e| DecodeError::Malformed(e.to_string()))
}
