//! Middle-end connection pool
//!
//! One pool per `(family, dc)`. A session borrows a connection for a single
//! packet write and hands it back, so a few connections carry many sessions.
//! Responses come back through the per-connection reader and the registry,
//! so a connection stays open while any session that wrote through it lives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::RpcWriter;
use super::handshake::{apply_nat, client_handshake, key_selector, KeyAddrs};
use super::reader::run_reader;
use super::registry::ConnRegistry;
use crate::config::ProxyConfig;
use crate::crypto::SecureRandom;
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;
use crate::protocol::rpc::{build_close_ext, build_proxy_req, ProxyReqHeader};
use crate::stats::Stats;
use crate::transport::socket::connect_bound;

/// Above this many remembered writers, forget the ones already gone.
const WRITERS_PRUNE_AT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// IPv4-mapped IPv6 peers count as IPv4.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

// ========== Connection ==========

/// State shared between a pooled connection and its reader task.
pub(super) struct MeConnShared {
    pub(super) addr: SocketAddr,
    writer: tokio::sync::Mutex<RpcWriter<OwnedWriteHalf>>,
    alive: AtomicBool,
    /// Sessions that wrote through this connection
    writers: Mutex<HashSet<u64>>,
    pub(super) cancel: CancellationToken,
}

impl MeConnShared {
    fn new(addr: SocketAddr, writer: RpcWriter<OwnedWriteHalf>) -> Self {
        Self {
            addr,
            writer: tokio::sync::Mutex::new(writer),
            alive: AtomicBool::new(true),
            writers: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub(super) async fn send(&self, payload: &[u8]) -> Result<()> {
        let res = self.writer.lock().await.send(payload).await;
        if res.is_err() {
            self.mark_dead();
        }
        res
    }

    pub(super) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn note_writer(&self, conn_id: u64, registry: &ConnRegistry) {
        let mut w = self.writers.lock();
        if w.len() >= WRITERS_PRUNE_AT {
            w.retain(|id| registry.contains(*id));
        }
        w.insert(conn_id);
    }

    /// Whether a session that wrote here is still registered.
    fn has_live_sessions(&self, registry: &ConnRegistry) -> bool {
        let mut w = self.writers.lock();
        w.retain(|id| registry.contains(*id));
        !w.is_empty()
    }

    pub(super) fn take_writers(&self) -> Vec<u64> {
        self.writers.lock().drain().collect()
    }
}

/// A handshaken middle-end connection. Dropping it closes it.
pub struct MeConnection {
    shared: Arc<MeConnShared>,
    family: IpFamily,
    dc: i16,
}

impl MeConnection {
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub fn dc(&self) -> i16 {
        self.dc
    }

    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.shared.send(payload).await
    }
}

impl Drop for MeConnection {
    fn drop(&mut self) {
        self.shared.mark_dead();
    }
}

impl std::fmt::Debug for MeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeConnection")
            .field("addr", &self.shared.addr)
            .field("family", &self.family)
            .field("dc", &self.dc)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Default)]
struct PoolEntry {
    idle: Mutex<VecDeque<MeConnection>>,
    /// Set whenever a dial was needed since the last cleanup tick
    pressure: AtomicBool,
}

impl PoolEntry {
    fn pop_live(&self) -> Option<MeConnection> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.pop_back() {
            if conn.is_alive() {
                return Some(conn);
            }
        }
        None
    }
}

// ========== Pool ==========

pub struct MePool {
    pools: DashMap<(IpFamily, i16), Arc<PoolEntry>>,
    registry: Arc<ConnRegistry>,
    /// Telegram proxy-secret (binary, not the client secret)
    proxy_secret: Vec<u8>,
    nat_ip: Option<IpAddr>,
    bind_ip: Option<IpAddr>,
    default_dc: i16,
    overrides: HashMap<i16, SocketAddr>,
    stats: Arc<Stats>,
    rng: Arc<SecureRandom>,
}

impl MePool {
    pub fn from_config(
        config: &ProxyConfig,
        proxy_secret: Vec<u8>,
        stats: Arc<Stats>,
        rng: Arc<SecureRandom>,
    ) -> Result<Arc<Self>> {
        if proxy_secret.len() < 32 {
            return Err(ProxyError::Config(format!(
                "proxy-secret too short: {} bytes (need >= 32)",
                proxy_secret.len()
            )));
        }
        let bind_ip = match config.upstream.interface.as_deref() {
            Some(s) => Some(s.parse::<IpAddr>().map_err(|_| {
                ProxyError::Config(format!("upstream.interface '{s}' is not an IP address"))
            })?),
            None => None,
        };

        info!(
            key_selector = format_args!("0x{:08x}", key_selector(&proxy_secret)),
            secret_len = proxy_secret.len(),
            "Middle-end pool ready"
        );

        Ok(Arc::new(Self {
            pools: DashMap::new(),
            registry: Arc::new(ConnRegistry::new()),
            proxy_secret,
            nat_ip: config.middle_proxy.nat_ip,
            bind_ip,
            default_dc: config.upstream.default_dc,
            overrides: config.me_overrides()?,
            stats,
            rng,
        }))
    }

    pub fn registry(&self) -> &Arc<ConnRegistry> {
        &self.registry
    }

    /// The pool a DC index is served by: known and overridden DCs keep their
    /// index, everything else goes to the default DC.
    pub fn pool_dc(&self, dc: i16) -> i16 {
        if self.overrides.contains_key(&dc) || TG_MIDDLE_PROXIES_V4.contains_key(&dc) {
            dc
        } else {
            self.default_dc
        }
    }

    fn endpoints(&self, family: IpFamily, dc: i16) -> Vec<SocketAddr> {
        // An override pins the DC to one address of one family.
        if let Some(addr) = self.overrides.get(&dc) {
            return if IpFamily::of(addr) == family { vec![*addr] } else { Vec::new() };
        }
        let table = match family {
            IpFamily::V4 => &*TG_MIDDLE_PROXIES_V4,
            IpFamily::V6 => &*TG_MIDDLE_PROXIES_V6,
        };
        table
            .get(&dc)
            .map(|v| v.iter().map(|(ip, port)| SocketAddr::new(*ip, *port)).collect())
            .unwrap_or_default()
    }

    fn entry(&self, family: IpFamily, dc: i16) -> Arc<PoolEntry> {
        self.pools.entry((family, dc)).or_default().value().clone()
    }

    /// Take an idle live connection, or dial a new one (`true`).
    ///
    /// IPv6 falls back to the IPv4 pool when no v6 connection can be had.
    pub async fn acquire(&self, family: IpFamily, dc: i16) -> Result<(MeConnection, bool)> {
        let dc = self.pool_dc(dc);
        let families: &[IpFamily] = match family {
            IpFamily::V6 => &[IpFamily::V6, IpFamily::V4],
            IpFamily::V4 => &[IpFamily::V4],
        };

        let mut last_err = None;
        for &fam in families {
            let entry = self.entry(fam, dc);
            if let Some(conn) = entry.pop_live() {
                return Ok((conn, false));
            }
            entry.pressure.store(true, Ordering::Release);
            match self.dial(fam, dc).await {
                Ok(conn) => return Ok((conn, true)),
                Err(e) => {
                    debug!(?fam, dc, error = %e, "Middle-end dial failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| ProxyError::UpstreamUnavailable(format!("no middle-end for DC {dc}"))))
    }

    /// Return a connection to its pool. Dead ones are dropped.
    pub fn release(&self, conn: MeConnection) {
        if !conn.is_alive() {
            return;
        }
        let entry = self.entry(conn.family, conn.dc);
        entry.idle.lock().push_back(conn);
    }

    async fn dial(&self, family: IpFamily, dc: i16) -> Result<MeConnection> {
        let endpoints = self.endpoints(family, dc);
        let mut last_err =
            ProxyError::UpstreamUnavailable(format!("no {family:?} middle-end for DC {dc}"));

        for addr in endpoints {
            match self.connect_one(addr, family, dc).await {
                Ok(conn) => {
                    self.stats.increment_me_dials();
                    info!(%addr, dc, "Middle-end connected");
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(%addr, dc, error = %e, "Middle-end connect failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn connect_one(&self, addr: SocketAddr, family: IpFamily, dc: i16) -> Result<MeConnection> {
        let bind = self.bind_ip.filter(|ip| ip.is_ipv4() == addr.is_ipv4());
        let stream = timeout(
            Duration::from_secs(ME_CONNECT_TIMEOUT_SECS),
            connect_bound(addr, bind),
        )
        .await
        .map_err(|_| ProxyError::ConnectionTimeout { addr: addr.to_string() })??;

        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let addrs = KeyAddrs {
            client: apply_nat(local, self.nat_ip),
            server: peer,
        };
        let (rd, wr) = stream.into_split();

        let (reader, writer) = timeout(
            Duration::from_secs(ME_HANDSHAKE_TIMEOUT_SECS),
            client_handshake(rd, wr, addrs, &self.proxy_secret, &self.rng),
        )
        .await
        .map_err(|_| ProxyError::TgHandshakeTimeout)??;

        let shared = Arc::new(MeConnShared::new(peer, writer));
        tokio::spawn(run_reader(reader, shared.clone(), self.registry.clone()));

        Ok(MeConnection { shared, family, dc })
    }

    /// Acquire, write one `RPC_PROXY_REQ`, release.
    pub async fn send_proxy_req(
        &self,
        family: IpFamily,
        dc: i16,
        hdr: &ProxyReqHeader<'_>,
        data: &[u8],
    ) -> Result<()> {
        let payload = build_proxy_req(hdr, data);
        let (conn, _) = self.acquire(family, dc).await?;
        conn.shared.note_writer(hdr.conn_id, &self.registry);
        let res = conn.send(&payload).await;
        self.release(conn);
        res
    }

    /// Tell the middle-end a session ended on our side and forget it.
    ///
    /// Goes out on an idle connection only; with none idle the middle-end
    /// times the session out on its own.
    pub async fn send_close(&self, family: IpFamily, dc: i16, conn_id: u64) -> Result<()> {
        self.registry.unregister(conn_id);

        let dc = self.pool_dc(dc);
        let Some(conn) = self.entry(family, dc).pop_live() else {
            debug!(conn_id, dc, "No idle middle-end connection for close");
            return Ok(());
        };
        let res = conn.send(&build_close_ext(conn_id)).await;
        self.release(conn);
        res
    }

    /// One damping step: every pool that needed no dial since the last tick
    /// closes at most one idle connection that no live session answers
    /// through. Returns how many were closed.
    pub fn cleanup_tick(&self) -> usize {
        let mut evicted = 0;
        for item in self.pools.iter() {
            let ((family, dc), entry) = (item.key(), item.value());
            let had_pressure = entry.pressure.swap(false, Ordering::AcqRel);

            let mut idle = entry.idle.lock();
            idle.retain(|c| c.is_alive());
            if had_pressure {
                continue;
            }
            let unused = idle
                .iter()
                .position(|c| !c.shared.has_live_sessions(&self.registry));
            if let Some(conn) = unused.and_then(|pos| idle.remove(pos)) {
                debug!(?family, dc, addr = %conn.addr(), "Closing idle middle-end connection");
                drop(conn);
                evicted += 1;
                self.stats.increment_me_evictions();
            }
        }
        evicted
    }

    pub fn idle_count(&self, family: IpFamily, dc: i16) -> usize {
        self.pools
            .get(&(family, self.pool_dc(dc)))
            .map(|e| e.idle.lock().len())
            .unwrap_or(0)
    }

    pub async fn run_cleanup(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.cleanup_tick();
                    if evicted > 0 {
                        debug!(evicted, "Middle-end pool cleanup");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! An in-process middle-end speaking the RPC protocol over loopback.
    //!
    //! It echoes every proxied packet back as a proxy answer, with a few
    //! word-sized magic payloads: `ack!` gets a simple ack, `bye!` gets a
    //! close-ext, `drop` closes the TCP connection, `ping` makes it ping the
    //! proxy and answer `pong` once the pong arrives.

    use std::sync::atomic::AtomicUsize;

    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::rpc::test_support::{build_proxy_ans, build_simple_ack, parse_proxy_req};
    use crate::transport::middle_proxy::handshake::test_support::server_handshake;

    pub const FAKE_ACK_CONFIRM: u32 = 0x1234;

    pub struct FakeMiddleEnd {
        pub addr: SocketAddr,
        pub accepted: Arc<AtomicUsize>,
        /// conn ids closed by the proxy
        pub closes: Arc<Mutex<Vec<u64>>>,
        /// ad tags seen on proxy requests
        pub ad_tags: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
    }

    pub async fn spawn_fake_middle_end(secret: Vec<u8>) -> FakeMiddleEnd {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(Mutex::new(Vec::new()));
        let ad_tags = Arc::new(Mutex::new(Vec::new()));

        let (acc, cl, tags) = (accepted.clone(), closes.clone(), ad_tags.clone());
        tokio::spawn(async move {
            let secret = Arc::new(secret);
            while let Ok((stream, peer)) = listener.accept().await {
                acc.fetch_add(1, Ordering::SeqCst);
                let (secret, cl, tags) = (secret.clone(), cl.clone(), tags.clone());
                tokio::spawn(async move {
                    let local = stream.local_addr().unwrap();
                    let (rd, wr) = stream.into_split();
                    let addrs = KeyAddrs { client: peer, server: local };
                    let rng = SecureRandom::new();
                    let Ok((mut reader, mut writer)) =
                        server_handshake(rd, wr, addrs, &secret, &rng).await
                    else {
                        return;
                    };

                    let mut last_conn = 0u64;
                    while let Ok(frame) = reader.read_frame().await {
                        let tag = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
                        if tag == RPC_CLOSE_EXT_U32 {
                            let mut id = [0u8; 8];
                            id.copy_from_slice(&frame[4..12]);
                            cl.lock().push(u64::from_le_bytes(id));
                            continue;
                        }
                        if tag == RPC_PONG_U32 {
                            let _ = writer.send(&build_proxy_ans(last_conn, b"pong")).await;
                            continue;
                        }

                        let req = parse_proxy_req(&frame);
                        last_conn = req.conn_id;
                        tags.lock().push(req.ad_tag.clone());
                        let reply = match &req.data[..] {
                            b"ack!" => build_simple_ack(req.conn_id, FAKE_ACK_CONFIRM),
                            b"bye!" => build_close_ext(req.conn_id).to_vec(),
                            b"drop" => return,
                            b"ping" => {
                                let mut p = RPC_PING_U32.to_le_bytes().to_vec();
                                p.extend_from_slice(&77i64.to_le_bytes());
                                p
                            }
                            data => build_proxy_ans(req.conn_id, data),
                        };
                        if writer.send(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        FakeMiddleEnd { addr, accepted, closes, ad_tags }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::protocol::rpc::ProxyReqHeader;
    use crate::transport::middle_proxy::MeResponse;
    use bytes::Bytes;
    use tokio::sync::mpsc::error::TryRecvError;

    const SECRET: [u8; 64] = [0x42; 64];

    async fn pool_with_fake() -> (Arc<MePool>, FakeMiddleEnd) {
        let fake = spawn_fake_middle_end(SECRET.to_vec()).await;
        let mut cfg = ProxyConfig::default();
        cfg.middle_proxy.overrides.insert("2".into(), fake.addr.to_string());
        let pool = MePool::from_config(
            &cfg,
            SECRET.to_vec(),
            Arc::new(Stats::new()),
            Arc::new(SecureRandom::new()),
        )
        .unwrap();
        (pool, fake)
    }

    fn header(conn_id: u64) -> ProxyReqHeader<'static> {
        ProxyReqHeader {
            conn_id,
            client_addr: "10.1.2.3:5555".parse().unwrap(),
            our_addr: "127.0.0.1:443".parse().unwrap(),
            proto_tag: ProtoTag::Intermediate,
            ad_tag: None,
            quick_ack: false,
        }
    }

    #[test]
    fn test_ip_family_of() {
        assert_eq!(IpFamily::of(&"1.2.3.4:1".parse().unwrap()), IpFamily::V4);
        assert_eq!(IpFamily::of(&"[::ffff:1.2.3.4]:1".parse().unwrap()), IpFamily::V4);
        assert_eq!(IpFamily::of(&"[2001:db8::1]:1".parse().unwrap()), IpFamily::V6);
    }

    #[tokio::test]
    async fn test_short_proxy_secret_rejected() {
        let res = MePool::from_config(
            &ProxyConfig::default(),
            vec![1; 16],
            Arc::new(Stats::new()),
            Arc::new(SecureRandom::new()),
        );
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_pool_dc_mapping() {
        let (pool, _fake) = pool_with_fake().await;
        assert_eq!(pool.pool_dc(2), 2);
        assert_eq!(pool.pool_dc(-4), -4);
        assert_eq!(pool.pool_dc(203), 2);
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let (pool, fake) = pool_with_fake().await;

        let (conn, fresh) = pool.acquire(IpFamily::V4, 2).await.unwrap();
        assert!(fresh);
        assert_eq!(conn.addr(), fake.addr);
        pool.release(conn);
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 1);

        let (conn, fresh) = pool.acquire(IpFamily::V4, 2).await.unwrap();
        assert!(!fresh);
        pool.release(conn);
        assert_eq!(fake.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_v6_falls_back_to_v4() {
        let (pool, fake) = pool_with_fake().await;
        // The IPv4 override leaves DC 2 without a v6 endpoint.
        let (conn, fresh) = pool.acquire(IpFamily::V6, 2).await.unwrap();
        assert!(fresh);
        assert_eq!(conn.addr(), fake.addr);
        assert_eq!(conn.family(), IpFamily::V4);
        pool.release(conn);
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 1);
        assert_eq!(pool.idle_count(IpFamily::V6, 2), 0);
    }

    #[tokio::test]
    async fn test_cleanup_damping() {
        let (pool, _fake) = pool_with_fake().await;

        let (a, _) = pool.acquire(IpFamily::V4, 2).await.unwrap();
        let (b, _) = pool.acquire(IpFamily::V4, 2).await.unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 2);

        // Dials happened since the last tick: nothing is closed, pressure clears.
        assert_eq!(pool.cleanup_tick(), 0);
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 2);

        // Quiet tick: exactly one idle connection goes.
        assert_eq!(pool.cleanup_tick(), 1);
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 1);
        assert_eq!(pool.cleanup_tick(), 1);
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 0);
        assert_eq!(pool.cleanup_tick(), 0);
    }

    #[tokio::test]
    async fn test_proxy_req_answer_routed_by_conn_id() {
        let (pool, _fake) = pool_with_fake().await;
        let rng = SecureRandom::new();
        let (id_a, mut rx_a) = pool.registry().register(&rng);
        let (id_b, mut rx_b) = pool.registry().register(&rng);

        pool.send_proxy_req(IpFamily::V4, 2, &header(id_a), b"for-a").await.unwrap();
        pool.send_proxy_req(IpFamily::V4, 2, &header(id_b), b"for-b").await.unwrap();
        pool.send_proxy_req(IpFamily::V4, 2, &header(id_a), b"ack!").await.unwrap();

        assert_eq!(rx_a.recv().await, Some(MeResponse::Data(Bytes::from_static(b"for-a"))));
        assert_eq!(rx_a.recv().await, Some(MeResponse::Ack(FAKE_ACK_CONFIRM)));
        assert_eq!(rx_b.recv().await, Some(MeResponse::Data(Bytes::from_static(b"for-b"))));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (pool, _fake) = pool_with_fake().await;
        let (id, mut rx) = pool.registry().register(&SecureRandom::new());
        pool.send_proxy_req(IpFamily::V4, 2, &header(id), b"ping").await.unwrap();
        assert_eq!(rx.recv().await, Some(MeResponse::Data(Bytes::from_static(b"pong"))));
    }

    #[tokio::test]
    async fn test_middle_end_close_unregisters() {
        let (pool, _fake) = pool_with_fake().await;
        let (id, mut rx) = pool.registry().register(&SecureRandom::new());
        pool.send_proxy_req(IpFamily::V4, 2, &header(id), b"bye!").await.unwrap();
        assert_eq!(rx.recv().await, Some(MeResponse::Close));
        assert!(!pool.registry().contains(id));
    }

    #[tokio::test]
    async fn test_dead_connection_closes_its_sessions() {
        let (pool, _fake) = pool_with_fake().await;
        let (id, mut rx) = pool.registry().register(&SecureRandom::new());
        pool.send_proxy_req(IpFamily::V4, 2, &header(id), b"drop").await.unwrap();
        assert_eq!(rx.recv().await, Some(MeResponse::Close));

        // The dead connection never comes back out of the pool.
        let (conn, fresh) = pool.acquire(IpFamily::V4, 2).await.unwrap();
        assert!(fresh);
        pool.release(conn);
    }

    #[tokio::test]
    async fn test_send_close_reaches_middle_end() {
        let (pool, fake) = pool_with_fake().await;
        let (id, mut rx) = pool.registry().register(&SecureRandom::new());
        pool.send_proxy_req(IpFamily::V4, 2, &header(id), b"hello").await.unwrap();
        assert!(rx.recv().await.is_some());

        pool.send_close(IpFamily::V4, 2, id).await.unwrap();
        assert!(!pool.registry().contains(id));

        // Push another request through the same connection to order after the close.
        let (other, mut rx2) = pool.registry().register(&SecureRandom::new());
        pool.send_proxy_req(IpFamily::V4, 2, &header(other), b"sync").await.unwrap();
        assert!(rx2.recv().await.is_some());
        assert_eq!(fake.closes.lock().as_slice(), &[id]);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_connection_with_live_session() {
        let (pool, fake) = pool_with_fake().await;
        let (id, mut rx) = pool.registry().register(&SecureRandom::new());
        pool.send_proxy_req(IpFamily::V4, 2, &header(id), b"hell").await.unwrap();
        assert_eq!(rx.recv().await, Some(MeResponse::Data(Bytes::from_static(b"hell"))));

        assert_eq!(pool.cleanup_tick(), 0);
        assert_eq!(pool.cleanup_tick(), 0);
        assert_eq!(pool.cleanup_tick(), 0);
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        pool.send_proxy_req(IpFamily::V4, 2, &header(id), b"more").await.unwrap();
        assert_eq!(rx.recv().await, Some(MeResponse::Data(Bytes::from_static(b"more"))));
        assert_eq!(fake.accepted.load(Ordering::SeqCst), 1);

        // Once the session is gone the connection is fair game.
        pool.send_close(IpFamily::V4, 2, id).await.unwrap();
        assert_eq!(pool.cleanup_tick(), 1);
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 0);
    }

    #[tokio::test]
    async fn test_cleanup_prefers_connection_without_sessions() {
        let (pool, _fake) = pool_with_fake().await;
        let (busy, _) = pool.acquire(IpFamily::V4, 2).await.unwrap();
        let (spare, _) = pool.acquire(IpFamily::V4, 2).await.unwrap();
        let spare_shared = spare.shared.clone();
        let (id, _rx) = pool.registry().register(&SecureRandom::new());
        busy.shared.note_writer(id, pool.registry());
        pool.release(busy);
        pool.release(spare);

        assert_eq!(pool.cleanup_tick(), 0);
        assert_eq!(pool.cleanup_tick(), 1);
        assert!(!spare_shared.is_alive());
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 1);
        assert_eq!(pool.cleanup_tick(), 0);
        assert_eq!(pool.idle_count(IpFamily::V4, 2), 1);
    }

    #[tokio::test]
    async fn test_stalled_session_does_not_block_reader() {
        let (pool, _fake) = pool_with_fake().await;
        let rng = SecureRandom::new();
        let (slow, _slow_rx) = pool.registry().register(&rng);
        let (fast, mut fast_rx) = pool.registry().register(&rng);

        for _ in 0..300 {
            pool.send_proxy_req(IpFamily::V4, 2, &header(slow), b"fill").await.unwrap();
        }
        pool.send_proxy_req(IpFamily::V4, 2, &header(fast), b"fast").await.unwrap();

        let got = timeout(Duration::from_secs(5), fast_rx.recv()).await.unwrap();
        assert_eq!(got, Some(MeResponse::Data(Bytes::from_static(b"fast"))));
        assert!(!pool.registry().contains(slow));
    }
}
