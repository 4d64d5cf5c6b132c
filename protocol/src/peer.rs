use chrono::{DateTime, Utc};
use rand::distributions::{Bernoulli, Distribution};
use std::net::SocketAddr;
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Message, MessageCodec};
use crate::error::{ProtocolError, Result};
use crate::types::{NodeIdentifier, SharePayload};

/// Lifecycle of the connection to one neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unconnected,
    Handshaking,
    Connected,
    Terminating,
    Terminated,
}

/// Combine the two HELLO nonces of one connection into the value both
/// ends agree on. The larger nonce fills the high half.
pub fn link_nonce(local: i32, remote: i32) -> i64 {
    let (high, low) = if local >= remote {
        (local, remote)
    } else {
        (remote, local)
    };
    (i64::from(high) << 32) | i64::from(low as u32)
}

/// Decide whether `candidate` replaces `existing` as the link to a peer.
/// On an exact tie the existing link is kept.
pub fn prefer_candidate(existing: i64, candidate: i64) -> bool {
    candidate > existing
}

/// Result of a completed HELLO exchange, before the link is registered.
pub struct Handshake {
    pub peer: NodeIdentifier,
    pub nonce: i64,
    pub remote_addr: Option<SocketAddr>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

/// Exchange HELLOs over a fresh connection. Both sides write their own
/// HELLO before reading the peer's, so dialer and acceptor run the same
/// steps.
pub async fn handshake(
    stream: TcpStream,
    self_id: &NodeIdentifier,
    codec: &MessageCodec,
) -> Result<Handshake> {
    let remote_addr = stream.peer_addr().ok();
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let local_nonce: i32 = rand::random();
    codec::write_frame(&mut writer, &codec.encode_hello(self_id, local_nonce)?).await?;

    let body = codec::read_frame(&mut reader).await?;
    let (peer, remote_nonce) = MessageCodec::decode_hello(&body)?;

    Ok(Handshake {
        peer,
        nonce: link_nonce(local_nonce, remote_nonce),
        remote_addr,
        reader,
        writer,
    })
}

/// Why a link's read loop ended.
#[derive(Debug)]
pub enum LinkExit {
    /// Local shutdown or replacement.
    Cancelled,
    /// The peer sent the close sentinel.
    ClosedByPeer,
    Failed(ProtocolError),
}

struct LinkStatus {
    state: LinkState,
    last_payload: Option<SharePayload>,
    last_touched: DateTime<Utc>,
}

/// One live connection to one neighbor.
pub struct NeighborLink {
    serial: u64,
    peer: NodeIdentifier,
    nonce: i64,
    remote_addr: Option<SocketAddr>,
    codec: MessageCodec,
    writer: Mutex<Option<OwnedWriteHalf>>,
    status: StdMutex<LinkStatus>,
    cancel: CancellationToken,
}

impl NeighborLink {
    /// Wrap a completed handshake. The read half is handed back for the
    /// caller to drive with [`NeighborLink::run_reader`].
    pub fn new(
        serial: u64,
        handshake: Handshake,
        codec: MessageCodec,
        cancel: CancellationToken,
    ) -> (Self, OwnedReadHalf) {
        let link = Self {
            serial,
            peer: handshake.peer,
            nonce: handshake.nonce,
            remote_addr: handshake.remote_addr,
            codec,
            writer: Mutex::new(Some(handshake.writer)),
            status: StdMutex::new(LinkStatus {
                state: LinkState::Handshaking,
                last_payload: None,
                last_touched: Utc::now(),
            }),
            cancel,
        };
        (link, handshake.reader)
    }

    fn status(&self) -> MutexGuard<'_, LinkStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Identifies this connection among every link the manager ever made.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer(&self) -> &NodeIdentifier {
        &self.peer
    }

    pub fn nonce(&self) -> i64 {
        self.nonce
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> LinkState {
        self.status().state
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.status().state = state;
    }

    pub fn last_touched(&self) -> DateTime<Utc> {
        self.status().last_touched
    }

    /// The most recent payload from the peer, if any arrived yet.
    pub fn latest_payload(&self) -> Option<SharePayload> {
        self.status().last_payload.clone()
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_touched());
        age.to_std().map(|age| age > max_age).unwrap_or(false)
    }

    fn record_payload(&self, payload: SharePayload) {
        let mut status = self.status();
        status.last_payload = Some(payload);
        status.last_touched = Utc::now();
    }

    /// Send one share message. Returns `Ok(false)` when the message was
    /// dropped by the configured loss simulation.
    pub async fn send(&self, payload: &SharePayload) -> Result<bool> {
        if self.state() != LinkState::Connected {
            return Err(ProtocolError::IllegalState(format!(
                "link to {} is {:?}",
                self.peer,
                self.state()
            )));
        }

        let drop_rate = self.codec.config().current().message_drop_percentage;
        if drop_rate > 0.0 {
            let drop = Bernoulli::new(drop_rate).map_err(|e| {
                ProtocolError::Config(format!("message_drop_percentage {drop_rate}: {e}"))
            })?;
            if drop.sample(&mut rand::thread_rng()) {
                tracing::trace!(peer = %self.peer, "Simulated message drop");
                return Ok(false);
            }
        }

        let body = self.codec.encode_share(payload)?;
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| {
            ProtocolError::IllegalState(format!("link to {} is closed", self.peer))
        })?;
        if let Err(e) = codec::write_frame(writer, &body).await {
            self.set_state(LinkState::Terminating);
            return Err(e);
        }
        Ok(true)
    }

    /// Read frames until the link is cancelled, the peer closes it, or the
    /// stream breaks. Every payload replaces the previous one.
    pub async fn run_reader(&self, mut reader: OwnedReadHalf) -> LinkExit {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return LinkExit::Cancelled,
                frame = codec::read_frame(&mut reader) => frame,
            };

            match frame.and_then(|body| MessageCodec::decode_message(&body)) {
                Ok(Message::ShareData(payload)) => {
                    tracing::trace!(peer = %self.peer, entries = payload.len(), "Share data received");
                    self.record_payload(payload);
                }
                Ok(Message::Close) => return LinkExit::ClosedByPeer,
                Err(e) => return LinkExit::Failed(e),
            }
        }
    }

    /// Stop the read loop and shut the write half down. With `notify_peer`
    /// a close frame is attempted first; it is abandoned after `timeout`.
    pub async fn close(&self, notify_peer: bool, timeout: Duration) {
        {
            let mut status = self.status();
            if status.state == LinkState::Terminated {
                return;
            }
            status.state = LinkState::Terminating;
        }
        self.cancel.cancel();

        let shutdown = async {
            let mut guard = self.writer.lock().await;
            if let Some(mut writer) = guard.take() {
                if notify_peer {
                    if let Ok(body) = self.codec.encode_close() {
                        let _ = codec::write_frame(&mut writer, &body).await;
                    }
                }
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
            }
        };
        if tokio::time::timeout(timeout, shutdown).await.is_err() {
            tracing::debug!(peer = %self.peer, "Close frame timed out");
        }
    }
}

impl std::fmt::Debug for NeighborLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborLink")
            .field("serial", &self.serial)
            .field("peer", &self.peer)
            .field("nonce", &self.nonce)
            .field("state", &self.state())
            .finish()
    }
}
