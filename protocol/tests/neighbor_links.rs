use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use regionmesh_protocol::codec::{read_frame, write_frame};
use regionmesh_protocol::peer::link_nonce;
use regionmesh_protocol::*;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("regionmesh_protocol=debug")
        .try_init();
}

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        handshake_timeout: Duration::from_secs(2),
        dial_attempts: 100,
        dial_backoff: Duration::from_millis(20),
        close_timeout: Duration::from_millis(200),
        stale_after: Duration::from_secs(30),
    }
}

fn id(name: &str) -> NodeIdentifier {
    NodeIdentifier::new(name)
}

fn payload(entries: &[(&str, i64)]) -> SharePayload {
    entries
        .iter()
        .map(|(k, v)| (CodePath::from(*k), GossipValue::Int(*v)))
        .collect()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn new_manager(lookup: &Arc<StaticNodeLookup>) -> NeighborConnectionManager {
    NeighborConnectionManager::new(lookup.clone(), ConfigHandle::default(), fast_config())
}

/// Start a node on an ephemeral port and publish the bound address.
async fn start_node(
    lookup: &Arc<StaticNodeLookup>,
    name: &str,
    known: &[&str],
) -> NeighborConnectionManager {
    start_node_with(lookup, name, known, ConfigHandle::default(), fast_config()).await
}

async fn start_node_with(
    lookup: &Arc<StaticNodeLookup>,
    name: &str,
    known: &[&str],
    network: ConfigHandle,
    config: ManagerConfig,
) -> NeighborConnectionManager {
    lookup.register(name, NodeAddress::new("127.0.0.1", 0));
    let manager = NeighborConnectionManager::new(lookup.clone(), network, config);
    manager
        .start(id(name), known.iter().map(|k| id(k)))
        .await
        .unwrap();
    lookup.register(name, manager.local_addr().unwrap().into());
    manager
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}

/// A hand-driven peer speaking the wire protocol directly.
struct RawPeer {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    codec: MessageCodec,
    link_nonce: i64,
}

impl RawPeer {
    async fn connect(addr: SocketAddr, name: &str, nonce: i32) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let codec = MessageCodec::default();

        // the accepting side speaks first
        let body = read_frame(&mut reader).await.unwrap();
        let (_, their_nonce) = MessageCodec::decode_hello(&body).unwrap();
        write_frame(&mut writer, &codec.encode_hello(&id(name), nonce).unwrap())
            .await
            .unwrap();

        Self {
            reader,
            writer,
            codec,
            link_nonce: link_nonce(their_nonce, nonce),
        }
    }

    async fn share(&mut self, payload: &SharePayload) {
        let body = self.codec.encode_share(payload).unwrap();
        write_frame(&mut self.writer, &body).await.unwrap();
    }

    async fn next_message(&mut self) -> Result<Message> {
        let body = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut self.reader))
            .await
            .expect("no frame from manager")?;
        MessageCodec::decode_message(&body)
    }
}

#[tokio::test]
async fn test_two_nodes_link_and_exchange() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let b = start_node(&lookup, "b", &[]).await;
    let a = start_node(&lookup, "a", &["b"]).await;

    eventually("a and b linked", || async {
        a.link_state(&id("b")).await == LinkState::Connected
            && b.link_state(&id("a")).await == LinkState::Connected
    })
    .await;
    assert_eq!(a.link_nonce(&id("b")).await, b.link_nonce(&id("a")).await);

    assert_eq!(a.broadcast(&payload(&[("x", 1)])).await, 1);
    eventually("b sees a's payload", || async {
        b.neighbor_snapshot().await.get(&id("a")) == Some(&payload(&[("x", 1)]))
    })
    .await;

    // nothing from b yet, so a's snapshot has no entry for it
    assert!(a.neighbor_snapshot().await.is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_snapshot_replaces_instead_of_merging() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let m = start_node(&lookup, "m", &[]).await;

    let mut peer = RawPeer::connect(m.local_addr().unwrap(), "p", 11).await;
    peer.share(&payload(&[("a", 1)])).await;
    peer.share(&payload(&[("b", 2)])).await;

    eventually("latest payload visible", || async {
        m.neighbor_snapshot().await.get(&id("p")) == Some(&payload(&[("b", 2)]))
    })
    .await;
    let snapshot = m.neighbor_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(!snapshot[&id("p")].contains_key(&CodePath::from("a")));

    m.stop().await;
}

#[tokio::test]
async fn test_stream_desync_tears_down_only_that_link() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let m = start_node(&lookup, "m", &[]).await;
    let good = start_node(&lookup, "good", &["m"]).await;
    eventually("good linked", || async {
        m.link_state(&id("good")).await == LinkState::Connected
    })
    .await;

    let mut bad = RawPeer::connect(m.local_addr().unwrap(), "bad", 3).await;
    eventually("bad linked", || async {
        m.link_state(&id("bad")).await == LinkState::Connected
    })
    .await;

    // a zero-length frame is below the protocol minimum
    bad.writer.write_all(&0i32.to_be_bytes()).await.unwrap();
    eventually("bad link terminated", || async {
        m.link_state(&id("bad")).await == LinkState::Terminated
    })
    .await;
    // torn down without a close frame: the stream simply ends
    assert!(matches!(bad.next_message().await, Err(e) if e.is_io()));

    assert_eq!(m.link_state(&id("good")).await, LinkState::Connected);
    assert_eq!(m.neighbors().await, vec![id("good")]);
    good.broadcast(&payload(&[("still", 1)])).await;
    eventually("good link still carries data", || async {
        m.neighbor_snapshot().await.contains_key(&id("good"))
    })
    .await;

    good.stop().await;
    m.stop().await;
}

#[tokio::test]
async fn test_duplicate_connection_keeps_greater_nonce() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let m = start_node(&lookup, "m", &[]).await;
    let addr = m.local_addr().unwrap();

    let mut first = RawPeer::connect(addr, "p", i32::MIN).await;
    eventually("first link registered", || async {
        m.link_nonce(&id("p")).await == Some(first.link_nonce)
    })
    .await;

    let mut second = RawPeer::connect(addr, "p", i32::MAX).await;
    let winner = first.link_nonce.max(second.link_nonce);
    assert_ne!(first.link_nonce, second.link_nonce);

    let (loser, survivor) = if second.link_nonce == winner {
        (&mut first, &mut second)
    } else {
        (&mut second, &mut first)
    };
    assert_eq!(loser.next_message().await.unwrap(), Message::Close);

    eventually("winner installed", || async {
        m.link_nonce(&id("p")).await == Some(winner)
    })
    .await;
    assert_eq!(m.neighbors().await, vec![id("p")]);

    survivor.share(&payload(&[("on-winner", 1)])).await;
    eventually("survivor carries data", || async {
        m.neighbor_snapshot().await.get(&id("p")) == Some(&payload(&[("on-winner", 1)]))
    })
    .await;

    m.stop().await;
    assert_eq!(survivor.next_message().await.unwrap(), Message::Close);
}

#[tokio::test]
async fn test_simultaneous_dial_converges_to_one_link() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    lookup.register("a", NodeAddress::new("127.0.0.1", free_port()));
    lookup.register("b", NodeAddress::new("127.0.0.1", free_port()));

    let a = new_manager(&lookup);
    let b = new_manager(&lookup);
    let (ra, rb) = tokio::join!(a.start(id("a"), [id("b")]), b.start(id("b"), [id("a")]));
    ra.unwrap();
    rb.unwrap();

    eventually("both sides agree on one link", || async {
        let na = a.link_nonce(&id("b")).await;
        let nb = b.link_nonce(&id("a")).await;
        na.is_some() && na == nb
    })
    .await;

    // let any losing connection finish tearing down, then re-check
    tokio::time::sleep(Duration::from_millis(300)).await;
    let na = a.link_nonce(&id("b")).await;
    assert!(na.is_some());
    assert_eq!(na, b.link_nonce(&id("a")).await);
    assert_eq!(a.neighbors().await, vec![id("b")]);
    assert_eq!(b.neighbors().await, vec![id("a")]);

    b.broadcast(&payload(&[("from-b", 2)])).await;
    eventually("payload crosses the surviving link", || async {
        a.neighbor_snapshot().await.contains_key(&id("b"))
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_dropped_peer_is_pruned_and_not_redialed() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let m = start_node(&lookup, "m", &[]).await;
    let peer = RawPeer::connect(m.local_addr().unwrap(), "p", 5).await;
    eventually("linked", || async {
        m.link_state(&id("p")).await == LinkState::Connected
    })
    .await;

    drop(peer);
    eventually("link pruned", || async {
        m.link_state(&id("p")).await == LinkState::Terminated
    })
    .await;
    assert!(m.neighbors().await.is_empty());
    assert_eq!(m.broadcast(&payload(&[("x", 1)])).await, 0);

    m.stop().await;
}

#[tokio::test]
async fn test_graceful_stop_notifies_neighbors() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let b = start_node(&lookup, "b", &[]).await;
    let a = start_node(&lookup, "a", &["b"]).await;
    eventually("linked", || async {
        b.link_state(&id("a")).await == LinkState::Connected
    })
    .await;

    a.stop().await;
    assert!(!a.is_running());
    assert_eq!(a.link_state(&id("b")).await, LinkState::Terminated);
    eventually("b saw the close", || async {
        b.link_state(&id("a")).await == LinkState::Terminated
    })
    .await;

    b.stop().await;
}

#[tokio::test]
async fn test_start_twice_and_stop_idempotent() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let m = start_node(&lookup, "m", &[]).await;

    let err = m.start(id("m"), []).await.unwrap_err();
    assert!(matches!(err, ProtocolError::IllegalState(_)));
    assert!(m.is_running());

    m.stop().await;
    m.stop().await;
    assert!(!m.is_running());

    // a stopped manager can be started again
    m.start(id("m"), []).await.unwrap();
    assert!(m.is_running());
    m.stop().await;

    let never_started = new_manager(&lookup);
    never_started.stop().await;
}

#[tokio::test]
async fn test_start_without_own_address_fails() {
    let lookup = Arc::new(StaticNodeLookup::new());
    let m = new_manager(&lookup);
    let err = m.start(id("ghost"), []).await.unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownNode(_)));
    assert!(!m.is_running());
}

#[tokio::test]
async fn test_dial_to_wrong_node_is_dropped() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let real = start_node(&lookup, "real", &[]).await;
    // "alias" points at real's listener
    lookup.register("alias", real.local_addr().unwrap().into());
    let a = start_node(&lookup, "a", &["alias"]).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.neighbors().await.is_empty());
    assert_eq!(a.link_state(&id("alias")).await, LinkState::Unconnected);

    a.stop().await;
    real.stop().await;
}

struct MaxKernel {
    seed: i64,
}

impl AggregateKernel for MaxKernel {
    fn run_round(&mut self, ctx: &RoundContext<'_>) -> Result<RoundOutput> {
        let key = CodePath::from("max");
        let best = ctx
            .neighbors
            .values()
            .filter_map(|p| p.get(&key).and_then(GossipValue::as_int))
            .fold(self.seed, i64::max);
        self.seed = best;
        let mut outbound = BTreeMap::new();
        outbound.insert(key, GossipValue::Int(best));
        Ok(RoundOutput {
            local_value: GossipValue::Int(best),
            outbound,
        })
    }
}

#[tokio::test]
async fn test_line_of_nodes_converges() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let c = start_node(&lookup, "c", &[]).await;
    let b = start_node(&lookup, "b", &["c"]).await;
    let a = start_node(&lookup, "a", &["b"]).await;

    let config = RuntimeConfig {
        cycle_interval: Duration::from_millis(20),
    };
    let runtimes = vec![
        NodeRuntime::new(id("a"), MaxKernel { seed: 3 }, a.clone(), config.clone()),
        NodeRuntime::new(id("b"), MaxKernel { seed: 1 }, b.clone(), config.clone()),
        NodeRuntime::new(id("c"), MaxKernel { seed: 9 }, c.clone(), config),
    ];
    for runtime in &runtimes {
        runtime.start_executing().unwrap();
    }

    eventually("every node holds the maximum", || async {
        runtimes
            .iter()
            .all(|r| r.local_value() == GossipValue::Int(9))
    })
    .await;

    for runtime in &runtimes {
        runtime.stop_executing().await;
        assert_eq!(runtime.state(), RuntimeState::Stopped);
        assert!(runtime.last_error().is_none());
    }
    for manager in [a, b, c] {
        manager.stop().await;
    }
}

#[tokio::test]
async fn test_drop_rate_controls_delivery() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let lossy = ConfigHandle::new(NetworkConfig {
        message_drop_percentage: 1.0,
        ..NetworkConfig::default()
    })
    .unwrap();
    let b = start_node(&lookup, "b", &[]).await;
    let a = start_node_with(&lookup, "a", &["b"], lossy.clone(), fast_config()).await;
    eventually("linked", || async {
        a.link_state(&id("b")).await == LinkState::Connected
            && b.link_state(&id("a")).await == LinkState::Connected
    })
    .await;

    for round in 0..20 {
        assert_eq!(a.broadcast(&payload(&[("lost", round)])).await, 0);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.neighbor_snapshot().await.is_empty());
    // dropped sends are not failures
    assert_eq!(a.link_state(&id("b")).await, LinkState::Connected);

    lossy.replace(NetworkConfig::default()).unwrap();
    assert_eq!(a.broadcast(&payload(&[("kept", 1)])).await, 1);
    eventually("delivered once loss is off", || async {
        b.neighbor_snapshot().await.get(&id("a")) == Some(&payload(&[("kept", 1)]))
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_silent_neighbor_is_reported_stale() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let config = ManagerConfig {
        stale_after: Duration::from_millis(150),
        ..fast_config()
    };
    let m = start_node_with(&lookup, "m", &[], ConfigHandle::default(), config).await;
    let addr = m.local_addr().unwrap();

    let _quiet = RawPeer::connect(addr, "quiet", 1).await;
    let mut chatty = RawPeer::connect(addr, "chatty", 2).await;
    eventually("both linked", || async {
        m.link_state(&id("quiet")).await == LinkState::Connected
            && m.link_state(&id("chatty")).await == LinkState::Connected
    })
    .await;

    let chatter = tokio::spawn(async move {
        loop {
            chatty.share(&payload(&[("tick", 1)])).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    eventually("only the quiet neighbor is stale", || async {
        m.stale_neighbors().await == vec![id("quiet")]
    })
    .await;
    assert!(!m.stale_neighbors().await.contains(&id("chatty")));

    chatter.abort();
    let _ = chatter.await;
    m.stop().await;
}

#[tokio::test]
async fn test_stale_link_yields_to_new_connection() {
    init_tracing();
    let lookup = Arc::new(StaticNodeLookup::new());
    let config = ManagerConfig {
        stale_after: Duration::from_millis(100),
        ..fast_config()
    };
    let m = start_node_with(&lookup, "m", &[], ConfigHandle::default(), config).await;
    let addr = m.local_addr().unwrap();

    // a connection whose peer went away without closing it
    let mut dead = RawPeer::connect(addr, "p", i32::MAX).await;
    eventually("first link registered", || async {
        m.link_nonce(&id("p")).await == Some(dead.link_nonce)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    // the restarted peer's link carries the smaller nonce but still wins
    let mut fresh = RawPeer::connect(addr, "p", i32::MIN).await;
    assert!(fresh.link_nonce < dead.link_nonce);
    assert_eq!(dead.next_message().await.unwrap(), Message::Close);
    eventually("fresh link installed", || async {
        m.link_nonce(&id("p")).await == Some(fresh.link_nonce)
    })
    .await;

    fresh.share(&payload(&[("back", 1)])).await;
    eventually("fresh link carries data", || async {
        m.neighbor_snapshot().await.get(&id("p")) == Some(&payload(&[("back", 1)]))
    })
    .await;

    m.stop().await;
}
