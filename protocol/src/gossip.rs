use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::MessageCodec;
use crate::config::{ConfigHandle, ManagerConfig};
use crate::error::{ProtocolError, Result};
use crate::lookup::NodeLookupService;
use crate::peer::{self, LinkExit, LinkState, NeighborLink};
use crate::types::{NodeIdentifier, SharePayload};

/// Owns every link of one node.
///
/// The manager:
/// 1. Listens for inbound connections on the node's own address
/// 2. Dials each known neighbor once at start-up (retrying while it is not
///    yet reachable)
/// 3. Keeps exactly one link per neighbor, resolving duplicates by nonce
/// 4. Exposes the latest payload from every neighbor and broadcasts ours
///
/// A broken link is pruned and not redialed; restarting the manager runs a
/// fresh dial sweep.
#[derive(Clone)]
pub struct NeighborConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    lookup: Arc<dyn NodeLookupService>,
    codec: MessageCodec,
    config: ManagerConfig,
    links: RwLock<HashMap<NodeIdentifier, Arc<NeighborLink>>>,
    /// Last state of peers whose links have ended.
    history: StdMutex<HashMap<NodeIdentifier, LinkState>>,
    session: StdMutex<Option<Session>>,
    next_serial: AtomicU64,
}

#[derive(Clone)]
struct Session {
    self_id: NodeIdentifier,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl NeighborConnectionManager {
    pub fn new(
        lookup: Arc<dyn NodeLookupService>,
        network: ConfigHandle,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                lookup,
                codec: MessageCodec::new(network),
                config,
                links: RwLock::new(HashMap::new()),
                history: StdMutex::new(HashMap::new()),
                session: StdMutex::new(None),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Bind the listener for `self_id` and start dialing `known_neighbors`.
    pub async fn start(
        &self,
        self_id: NodeIdentifier,
        known_neighbors: impl IntoIterator<Item = NodeIdentifier>,
    ) -> Result<()> {
        if self.inner.session().is_some() {
            return Err(ProtocolError::IllegalState(format!(
                "neighbor manager for {self_id} already started"
            )));
        }

        let address = self
            .inner
            .lookup
            .lookup(&self_id)
            .ok_or_else(|| ProtocolError::UnknownNode(self_id.clone()))?;
        let listener = TcpListener::bind((address.host.as_str(), address.port)).await?;
        let local_addr = listener.local_addr()?;

        let session = Session {
            self_id: self_id.clone(),
            local_addr,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        {
            let mut slot = self.inner.session();
            if slot.is_some() {
                return Err(ProtocolError::IllegalState(format!(
                    "neighbor manager for {self_id} already started"
                )));
            }
            *slot = Some(session.clone());
        }

        tracing::info!(node = %self_id, addr = %local_addr, "Neighbor manager listening");

        session
            .tasks
            .spawn(accept_loop(self.inner.clone(), session.clone(), listener));

        let mut dials = 0;
        for peer in known_neighbors {
            if peer == self_id {
                continue;
            }
            session
                .tasks
                .spawn(dial(self.inner.clone(), session.clone(), peer));
            dials += 1;
        }
        tracing::debug!(node = %self_id, dials, "Dial sweep started");
        Ok(())
    }

    /// Interrupt the listener and every link, send close frames, and wait
    /// for every spawned task to finish. A no-op when not running.
    pub async fn stop(&self) {
        let Some(session) = self.inner.session().take() else {
            return;
        };
        tracing::info!(node = %session.self_id, "Stopping neighbor manager");

        session.cancel.cancel();
        let links: Vec<Arc<NeighborLink>> = {
            let mut table = self.inner.links.write().await;
            table.drain().map(|(_, link)| link).collect()
        };
        for link in &links {
            link.close(true, self.inner.config.close_timeout).await;
        }

        session.tasks.close();
        session.tasks.wait().await;

        for link in &links {
            link.set_state(LinkState::Terminated);
            self.inner.remember(link.peer(), LinkState::Terminated);
        }
        tracing::info!(node = %session.self_id, closed = links.len(), "Neighbor manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.session().is_some()
    }

    pub fn self_id(&self) -> Option<NodeIdentifier> {
        self.inner.session().as_ref().map(|s| s.self_id.clone())
    }

    /// The address the listener actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.session().as_ref().map(|s| s.local_addr)
    }

    /// Latest payload of every connected neighbor that has sent one.
    pub async fn neighbor_snapshot(&self) -> BTreeMap<NodeIdentifier, SharePayload> {
        let links = self.inner.links.read().await;
        links
            .iter()
            .filter(|(_, link)| link.state() == LinkState::Connected)
            .filter_map(|(id, link)| link.latest_payload().map(|p| (id.clone(), p)))
            .collect()
    }

    /// Send `payload` to every neighbor. A failed send tears that link down.
    /// Returns how many neighbors the payload was written to.
    pub async fn broadcast(&self, payload: &SharePayload) -> usize {
        let targets: Vec<Arc<NeighborLink>> =
            self.inner.links.read().await.values().cloned().collect();

        let mut delivered = 0;
        for link in targets {
            match link.send(payload).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(peer = %link.peer(), error = %e, "Send failed, dropping link");
                    self.inner.terminate(&link).await;
                }
            }
        }
        delivered
    }

    pub async fn neighbors(&self) -> Vec<NodeIdentifier> {
        let mut ids: Vec<_> = self.inner.links.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn link_state(&self, peer: &NodeIdentifier) -> LinkState {
        if let Some(link) = self.inner.links.read().await.get(peer) {
            return link.state();
        }
        self.inner
            .history()
            .get(peer)
            .copied()
            .unwrap_or(LinkState::Unconnected)
    }

    pub async fn link_nonce(&self, peer: &NodeIdentifier) -> Option<i64> {
        self.inner.links.read().await.get(peer).map(|l| l.nonce())
    }

    /// Neighbors that have not sent anything within `stale_after`.
    pub async fn stale_neighbors(&self) -> Vec<NodeIdentifier> {
        let max_age = self.inner.config.stale_after;
        let links = self.inner.links.read().await;
        links
            .values()
            .filter(|link| link.is_stale(max_age))
            .map(|link| link.peer().clone())
            .collect()
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, HashMap<NodeIdentifier, LinkState>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remember(&self, peer: &NodeIdentifier, state: LinkState) {
        self.history().insert(peer.clone(), state);
    }

    async fn has_link(&self, peer: &NodeIdentifier) -> bool {
        self.links.read().await.contains_key(peer)
    }

    /// Remove `link` from the table unless it was already replaced.
    async fn remove(&self, link: &NeighborLink) -> bool {
        let mut links = self.links.write().await;
        match links.get(link.peer()) {
            Some(current) if current.serial() == link.serial() => {
                links.remove(link.peer());
                true
            }
            _ => false,
        }
    }

    async fn terminate(&self, link: &Arc<NeighborLink>) {
        self.remove(link).await;
        link.close(false, self.config.close_timeout).await;
    }

    /// Whether `candidate` should displace `existing`. A link that stopped
    /// being usable or has been silent past `stale_after` always yields, so
    /// a peer that restarts without closing its old connection can get back
    /// in. Otherwise the greater nonce wins.
    fn replaceable(&self, existing: &NeighborLink, candidate: &NeighborLink) -> bool {
        existing.state() != LinkState::Connected
            || existing.is_stale(self.config.stale_after)
            || peer::prefer_candidate(existing.nonce(), candidate.nonce())
    }

    /// Install a freshly handshaken link, resolving a duplicate connection
    /// to the same peer with [`Inner::replaceable`].
    async fn register(self: &Arc<Self>, session: &Session, handshake: peer::Handshake) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (link, reader) = NeighborLink::new(
            serial,
            handshake,
            self.codec.clone(),
            session.cancel.child_token(),
        );
        let link = Arc::new(link);
        let peer = link.peer().clone();

        let (accepted, displaced) = {
            let mut links = self.links.write().await;
            if session.cancel.is_cancelled() {
                (false, None)
            } else {
                match links.get(&peer) {
                    Some(existing) if !self.replaceable(existing, &link) => {
                        tracing::info!(
                            peer = %peer,
                            kept = existing.nonce(),
                            rejected = link.nonce(),
                            "Duplicate link, keeping existing"
                        );
                        (false, None)
                    }
                    _ => {
                        link.set_state(LinkState::Connected);
                        (true, links.insert(peer.clone(), link.clone()))
                    }
                }
            }
        };

        if let Some(old) = displaced {
            tracing::info!(
                peer = %peer,
                kept = link.nonce(),
                rejected = old.nonce(),
                "Duplicate link, replacing existing"
            );
            old.close(true, self.config.close_timeout).await;
        }

        if !accepted {
            link.close(true, self.config.close_timeout).await;
            link.set_state(LinkState::Terminated);
            return;
        }

        tracing::info!(
            node = %session.self_id,
            peer = %peer,
            nonce = link.nonce(),
            remote = ?link.remote_addr(),
            "🔗 Neighbor link established"
        );
        session.tasks.spawn(drive_link(self.clone(), link, reader));
    }
}

async fn drive_link(inner: Arc<Inner>, link: Arc<NeighborLink>, reader: tokio::net::tcp::OwnedReadHalf) {
    let exit = link.run_reader(reader).await;
    let removed = inner.remove(&link).await;

    match &exit {
        LinkExit::Cancelled => {
            tracing::debug!(peer = %link.peer(), "Link read loop interrupted");
        }
        LinkExit::ClosedByPeer => {
            tracing::info!(peer = %link.peer(), "Peer closed link");
            link.close(false, inner.config.close_timeout).await;
        }
        LinkExit::Failed(e) => {
            tracing::warn!(peer = %link.peer(), error = %e, "Link failed, tearing down");
            link.close(false, inner.config.close_timeout).await;
        }
    }

    link.set_state(LinkState::Terminated);
    if removed || !inner.has_link(link.peer()).await {
        inner.remember(link.peer(), LinkState::Terminated);
    }
}

async fn accept_loop(inner: Arc<Inner>, session: Session, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = session.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                tracing::debug!(node = %session.self_id, remote = %remote, "Inbound connection");
                session
                    .tasks
                    .spawn(accept_one(inner.clone(), session.clone(), stream));
            }
            Err(e) => {
                tracing::warn!(node = %session.self_id, error = %e, "Accept failed");
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                }
            }
        }
    }
    tracing::debug!(node = %session.self_id, "Listener stopped");
}

async fn accept_one(inner: Arc<Inner>, session: Session, stream: TcpStream) {
    let exchange = tokio::time::timeout(
        inner.config.handshake_timeout,
        peer::handshake(stream, &session.self_id, &inner.codec),
    );
    let handshake = tokio::select! {
        _ = session.cancel.cancelled() => return,
        result = exchange => result,
    };

    match handshake {
        Ok(Ok(handshake)) if handshake.peer == session.self_id => {
            tracing::warn!(node = %session.self_id, "Dropping connection from self");
        }
        Ok(Ok(handshake)) => inner.register(&session, handshake).await,
        Ok(Err(e)) => {
            tracing::warn!(node = %session.self_id, error = %e, "Inbound handshake failed");
        }
        Err(_) => {
            tracing::warn!(node = %session.self_id, "Inbound handshake timed out");
        }
    }
}

async fn dial(inner: Arc<Inner>, session: Session, peer: NodeIdentifier) {
    let Some(address) = inner.lookup.lookup(&peer) else {
        tracing::debug!(peer = %peer, "No address for neighbor, not dialing");
        return;
    };

    for attempt in 1..=inner.config.dial_attempts {
        if session.cancel.is_cancelled() {
            return;
        }
        if inner.has_link(&peer).await {
            tracing::debug!(peer = %peer, "Already linked, skipping dial");
            return;
        }

        let attempt_result = async {
            let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
            peer::handshake(stream, &session.self_id, &inner.codec).await
        };
        let outcome = tokio::select! {
            _ = session.cancel.cancelled() => return,
            outcome = tokio::time::timeout(inner.config.handshake_timeout, attempt_result) => outcome,
        };

        match outcome {
            Ok(Ok(handshake)) if handshake.peer != peer => {
                let e = ProtocolError::HandshakeMismatch {
                    expected: peer.clone(),
                    actual: handshake.peer.clone(),
                };
                tracing::warn!(addr = %address, error = %e, "Dropping mismatched connection");
                return;
            }
            Ok(Ok(handshake)) => {
                inner.register(&session, handshake).await;
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, attempt, error = %e, "Dial failed");
            }
            Err(_) => {
                tracing::debug!(peer = %peer, attempt, "Dial timed out");
            }
        }

        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.config.dial_backoff) => {}
        }
    }

    tracing::warn!(
        peer = %peer,
        addr = %address,
        attempts = inner.config.dial_attempts,
        "Giving up dialing neighbor"
    );
}
