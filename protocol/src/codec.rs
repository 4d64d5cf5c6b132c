//! Wire codec for neighbor links.
//!
//! Every message travels as one frame:
//!
//! ```text
//! [i32 length, big-endian][body: length bytes]
//! ```
//!
//! A HELLO body is `[i32 idLen][encoded NodeIdentifier][i32 nonce]`. Every
//! other body is a single encoded object: a SHARE_DATA state map, or the
//! close sentinel string asking the peer to shut the link down gracefully.
//!
//! An encoded object is `[flags][bytes]`. The flags byte records which
//! serializer produced `bytes` and whether they were deflated, so the
//! receiver always reverses exactly the pipeline the sender used.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ConfigHandle;
use crate::error::{ProtocolError, Result};
use crate::types::{NodeIdentifier, SharePayload};

/// Frame body asking the receiving side to close the link.
pub const CLOSE_SENTINEL: &str = "regionmesh:close-link";

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Smallest valid HELLO body: an id length and a nonce.
pub const HELLO_MIN_LEN: usize = 8;

const FLAG_COMPACT: u8 = 0b0000_0001;
const FLAG_COMPRESSED: u8 = 0b0000_0010;
const KNOWN_FLAGS: u8 = FLAG_COMPACT | FLAG_COMPRESSED;

/// Inflated objects larger than this are treated as garbage.
const MAX_INFLATED_LEN: u64 = 4 * MAX_FRAME_LEN as u64;

/// Message received on an established link. The HELLO exchange is
/// decoded separately by [`MessageCodec::decode_hello`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ShareData(SharePayload),
    Close,
}

// Encoding and decoding views of the same enum. Variant order must match.
#[derive(Serialize)]
enum WireRef<'a> {
    Node(&'a NodeIdentifier),
    Share(&'a SharePayload),
    Text(&'a str),
}

#[derive(Deserialize)]
enum WireObject {
    Node(NodeIdentifier),
    Share(SharePayload),
    Text(String),
}

impl WireObject {
    fn kind(&self) -> &'static str {
        match self {
            WireObject::Node(_) => "node identifier",
            WireObject::Share(_) => "share data",
            WireObject::Text(_) => "text",
        }
    }
}

/// Encodes and decodes link messages using the current [`NetworkConfig`].
///
/// [`NetworkConfig`]: crate::config::NetworkConfig
#[derive(Clone, Default)]
pub struct MessageCodec {
    config: ConfigHandle,
}

impl MessageCodec {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    fn encode_object(&self, object: WireRef<'_>) -> Result<Vec<u8>> {
        let config = self.config.current();

        let mut flags = 0u8;
        let serialized = if config.use_compact_serialization {
            flags |= FLAG_COMPACT;
            bincode::serialize(&object).map_err(|e| ProtocolError::Encode(e.to_string()))?
        } else {
            serde_json::to_vec(&object).map_err(|e| ProtocolError::Encode(e.to_string()))?
        };

        let bytes = if config.use_compression {
            flags |= FLAG_COMPRESSED;
            deflate(&serialized)?
        } else {
            serialized
        };

        let mut out = Vec::with_capacity(bytes.len() + 1);
        out.push(flags);
        out.extend_from_slice(&bytes);
        Ok(out)
    }

    fn decode_object(encoded: &[u8]) -> Result<WireObject> {
        let (&flags, bytes) = encoded
            .split_first()
            .ok_or_else(|| ProtocolError::StreamOutOfSync("empty encoded object".into()))?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(ProtocolError::StreamOutOfSync(format!(
                "unknown encoding flags {flags:#04x}"
            )));
        }

        let inflated;
        let bytes = if flags & FLAG_COMPRESSED != 0 {
            inflated = inflate(bytes)?;
            &inflated[..]
        } else {
            bytes
        };

        let object = if flags & FLAG_COMPACT != 0 {
            bincode::deserialize(bytes).map_err(|e| {
                ProtocolError::StreamOutOfSync(format!("undecodable compact object: {e}"))
            })?
        } else {
            serde_json::from_slice(bytes).map_err(|e| {
                ProtocolError::StreamOutOfSync(format!("undecodable verbose object: {e}"))
            })?
        };
        Ok(object)
    }

    pub fn encode_hello(&self, node: &NodeIdentifier, nonce: i32) -> Result<Vec<u8>> {
        let id = self.encode_object(WireRef::Node(node))?;
        let id_len =
            i32::try_from(id.len()).map_err(|_| ProtocolError::Encode("node id too long".into()))?;

        let mut body = Vec::with_capacity(HELLO_MIN_LEN + id.len());
        body.extend_from_slice(&id_len.to_be_bytes());
        body.extend_from_slice(&id);
        body.extend_from_slice(&nonce.to_be_bytes());
        Ok(body)
    }

    pub fn decode_hello(body: &[u8]) -> Result<(NodeIdentifier, i32)> {
        if body.len() < HELLO_MIN_LEN {
            return Err(ProtocolError::StreamOutOfSync(format!(
                "hello of {} bytes is shorter than the {HELLO_MIN_LEN} byte minimum",
                body.len()
            )));
        }
        let id_len = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let id_len = usize::try_from(id_len)
            .ok()
            .filter(|len| *len == body.len() - HELLO_MIN_LEN)
            .ok_or_else(|| {
                ProtocolError::StreamOutOfSync(format!(
                    "hello id length {id_len} does not match a {} byte body",
                    body.len()
                ))
            })?;

        let id_end = 4 + id_len;
        let node = match Self::decode_object(&body[4..id_end])? {
            WireObject::Node(node) => node,
            other => {
                return Err(ProtocolError::StreamOutOfSync(format!(
                    "expected node identifier in hello, got {}",
                    other.kind()
                )))
            }
        };
        let nonce = i32::from_be_bytes([
            body[id_end],
            body[id_end + 1],
            body[id_end + 2],
            body[id_end + 3],
        ]);
        Ok((node, nonce))
    }

    pub fn encode_share(&self, payload: &SharePayload) -> Result<Vec<u8>> {
        self.encode_object(WireRef::Share(payload))
    }

    pub fn encode_close(&self) -> Result<Vec<u8>> {
        self.encode_object(WireRef::Text(CLOSE_SENTINEL))
    }

    /// Decode a frame received after the handshake: share data or close.
    pub fn decode_message(body: &[u8]) -> Result<Message> {
        match Self::decode_object(body)? {
            WireObject::Share(payload) => Ok(Message::ShareData(payload)),
            WireObject::Text(text) if text == CLOSE_SENTINEL => Ok(Message::Close),
            WireObject::Text(text) => Err(ProtocolError::StreamOutOfSync(format!(
                "unexpected text frame {text:?}"
            ))),
            other => Err(ProtocolError::StreamOutOfSync(format!(
                "expected share data, got {}",
                other.kind()
            ))),
        }
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::Encode(format!("deflate failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Encode(format!("deflate failed: {e}")))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .take(MAX_INFLATED_LEN)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::StreamOutOfSync(format!("inflate failed: {e}")))?;
    Ok(out)
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::Encode(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            body.len()
        )));
    }
    // one buffer so a frame is never half-written by an interrupted send
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as i32).to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame body.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32().await?;
    if len <= 0 {
        return Err(ProtocolError::StreamOutOfSync(format!(
            "frame length {len} is below the protocol minimum"
        )));
    }
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::StreamOutOfSync(format!(
            "frame length {len} exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
