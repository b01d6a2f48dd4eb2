//! Accept loop and per-session supervisor

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::handle_client;
use super::context::ProxyContext;
use crate::error::Result;
use crate::stats::Stats;
use crate::transport::configure_client_socket;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections until `shutdown` fires. One task per session, each
/// watched by a supervisor so a panic stays inside its session.
pub async fn run_listener(listener: TcpListener, ctx: Arc<ProxyContext>, shutdown: CancellationToken) {
    let local = listener.local_addr().ok();
    info!(addr = ?local, "Listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let permit = match &ctx.admission {
            Some(gate) => match gate.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!(peer = %peer, "Connection limit reached, dropping");
                    continue;
                }
            },
            None => None,
        };

        let timeouts = ctx.snapshot().timeouts.clone();
        if let Err(e) = configure_client_socket(&stream, timeouts.client_keepalive, timeouts.client_ack) {
            debug!(peer = %peer, error = %e, "Failed to configure client socket");
        }

        let session_ctx = ctx.clone();
        let session = tokio::spawn(async move {
            let _permit = permit;
            handle_client(stream, peer, session_ctx).await
        });
        tokio::spawn(supervise(session, peer, ctx.stats.clone()));
    }

    info!(addr = ?local, "Listener stopped");
}

/// Wait for a session and account for how it ended.
pub(crate) async fn supervise(session: JoinHandle<Result<()>>, peer: SocketAddr, stats: Arc<Stats>) {
    match session.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_upstream_fault() => warn!(peer = %peer, error = %e, "Session failed upstream"),
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "Session closed with error"),
        Err(e) if e.is_panic() => {
            stats.increment_session_panics();
            error!(peer = %peer, "Session panicked");
        }
        Err(_) => debug!(peer = %peer, "Session cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::watch;
    use tokio::time::timeout;

    use crate::config::ProxyConfig;
    use crate::crypto::SecureRandom;
    use crate::protocol::constants::*;
    use crate::protocol::obfuscation::{make_client_frame, ObfuscationParams};
    use crate::stream::{AckFlags, CryptoReader, CryptoWriter, FramedReader, FramedWriter};
    use crate::transport::bind_listener;
    use crate::transport::middle_proxy::pool::test_support::{spawn_fake_middle_end, FAKE_ACK_CONFIRM};
    use crate::transport::middle_proxy::MePool;
    use crate::transport::ListenOptions;

    const SECRET_HEX: &str = "00112233445566778899aabbccddeeff";
    const AD_TAG_HEX: &str = "0123456789abcdef0123456789abcdef";
    const PROXY_SECRET: [u8; 64] = [0x42; 64];
    const WAIT: Duration = Duration::from_secs(5);

    struct FakeDc {
        addr: SocketAddr,
        accepted: Arc<AtomicUsize>,
    }

    /// A Telegram DC stand-in: reads the proxy's frame and echoes the
    /// decrypted stream back, closing after `echo_limit` reads if set.
    async fn spawn_fake_dc(echo_limit: Option<usize>) -> FakeDc {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut frame = [0u8; HANDSHAKE_LEN];
                    stream.read_exact(&mut frame).await.unwrap();
                    let params = ObfuscationParams::from_frame(&frame, None).unwrap();
                    let ciphers = params.cipher_pair();

                    let (rd, wr) = stream.into_split();
                    let mut reader = CryptoReader::new(rd, ciphers.decryptor);
                    let mut writer = CryptoWriter::new(wr, ciphers.encryptor);
                    let mut buf = [0u8; 4096];
                    let mut reads = 0;
                    loop {
                        let n = match reader.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        if writer.write_all(&buf[..n]).await.is_err() || writer.flush().await.is_err() {
                            return;
                        }
                        reads += 1;
                        if echo_limit == Some(reads) {
                            let _ = writer.shutdown().await;
                            return;
                        }
                    }
                });
            }
        });

        FakeDc { addr, accepted }
    }

    struct RunningProxy {
        addr: SocketAddr,
        ctx: Arc<ProxyContext>,
        shutdown: CancellationToken,
    }

    impl Drop for RunningProxy {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn start_proxy(cfg: ProxyConfig, pool: Option<Arc<MePool>>) -> RunningProxy {
        let (_tx, rx) = watch::channel(Arc::new(cfg));
        let mut ctx = ProxyContext::new(rx, Arc::new(Stats::new()), Arc::new(SecureRandom::new())).unwrap();
        if let Some(pool) = pool {
            ctx = ctx.with_me_pool(pool);
        }
        let ctx = Arc::new(ctx);

        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &ListenOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(run_listener(listener, ctx.clone(), shutdown.clone()));
        RunningProxy { addr, ctx, shutdown }
    }

    fn direct_config(dc_addr: SocketAddr) -> ProxyConfig {
        let mut cfg = ProxyConfig::default();
        cfg.access.secret = SECRET_HEX.into();
        cfg.upstream.dc_overrides.insert("2".into(), dc_addr.to_string());
        cfg
    }

    fn secret_bytes() -> Vec<u8> {
        hex::decode(SECRET_HEX).unwrap()
    }

    type ClientReader = FramedReader<CryptoReader<tokio::net::tcp::OwnedReadHalf>>;
    type ClientWriter = FramedWriter<CryptoWriter<tokio::net::tcp::OwnedWriteHalf>>;

    /// Connect as a client, send `frame` and wrap the socket in the
    /// client's framing.
    async fn client_with_frame(
        proxy: SocketAddr,
        proto: ProtoTag,
        frame: &[u8; HANDSHAKE_LEN],
        ciphers: crate::protocol::obfuscation::CipherPair,
    ) -> (ClientReader, ClientWriter) {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(frame).await.unwrap();
        let (rd, wr) = stream.into_split();
        (
            FramedReader::new(CryptoReader::new(rd, ciphers.decryptor), proto),
            FramedWriter::new(CryptoWriter::new(wr, ciphers.encryptor), proto, Arc::new(SecureRandom::new())),
        )
    }

    async fn connect_client(proxy: SocketAddr, proto: ProtoTag, dc: i16) -> (ClientReader, ClientWriter) {
        let (ciphers, frame) = make_client_frame(&SecureRandom::new(), proto, dc, &secret_bytes());
        client_with_frame(proxy, proto, &frame, ciphers).await
    }

    /// True once the peer closed: EOF or a reset.
    async fn closed_by_peer<R: AsyncRead + Unpin>(reader: &mut R) -> bool {
        let mut byte = [0u8; 1];
        matches!(timeout(WAIT, reader.read(&mut byte)).await, Ok(Ok(0)) | Ok(Err(_)))
    }

    #[tokio::test]
    async fn test_supervisor_counts_panics() {
        let stats = Arc::new(Stats::new());
        let session: JoinHandle<Result<()>> = tokio::spawn(async { panic!("session blew up") });
        supervise(session, "127.0.0.1:1".parse().unwrap(), stats.clone()).await;
        assert_eq!(stats.snapshot().session_panics, 1);

        let ok: JoinHandle<Result<()>> = tokio::spawn(async { Ok(()) });
        supervise(ok, "127.0.0.1:1".parse().unwrap(), stats.clone()).await;
        assert_eq!(stats.snapshot().session_panics, 1);
    }

    #[tokio::test]
    async fn test_direct_abridged_echo() {
        let dc = spawn_fake_dc(None).await;
        let proxy = start_proxy(direct_config(dc.addr), None).await;

        let (mut reader, mut writer) = connect_client(proxy.addr, ProtoTag::Abridged, 2).await;
        let mut flags = AckFlags::default();
        for payload in [&b"abcd"[..], &[7u8; 4096][..]] {
            writer.write_packet(payload, AckFlags::default()).await.unwrap();
            let echoed = timeout(WAIT, reader.read_packet(&mut flags)).await.unwrap().unwrap();
            assert_eq!(&echoed[..], payload);
        }
        assert_eq!(dc.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.ctx.stats.snapshot().connects_all, 1);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_stay_separate() {
        let dc = spawn_fake_dc(None).await;
        let proxy = start_proxy(direct_config(dc.addr), None).await;

        let sessions = (0u8..8).map(|i| {
            let addr = proxy.addr;
            async move {
                let (mut reader, mut writer) = connect_client(addr, ProtoTag::Secure, 2).await;
                let payload = vec![i; 64];
                writer.write_packet(&payload, AckFlags::default()).await.unwrap();
                let mut flags = AckFlags::default();
                let echoed = timeout(WAIT, reader.read_packet(&mut flags)).await.unwrap().unwrap();
                assert_eq!(&echoed[..], &payload[..]);
            }
        });
        futures::future::join_all(sessions).await;

        assert_eq!(dc.accepted.load(Ordering::SeqCst), 8);
        assert_eq!(proxy.ctx.stats.snapshot().connects_all, 8);
    }

    #[tokio::test]
    async fn test_upstream_close_closes_client() {
        let dc = spawn_fake_dc(Some(1)).await;
        let proxy = start_proxy(direct_config(dc.addr), None).await;

        let (mut reader, mut writer) = connect_client(proxy.addr, ProtoTag::Intermediate, 2).await;
        writer.write_packet(b"last", AckFlags::default()).await.unwrap();
        let mut flags = AckFlags::default();
        let echoed = timeout(WAIT, reader.read_packet(&mut flags)).await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"last");

        let res = timeout(WAIT, reader.read_packet(&mut flags)).await.unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_replayed_handshake_dropped_before_dial() {
        let dc = spawn_fake_dc(None).await;
        let proxy = start_proxy(direct_config(dc.addr), None).await;
        let rng = SecureRandom::new();

        let (ciphers, frame) = make_client_frame(&rng, ProtoTag::Abridged, 2, &secret_bytes());
        let (mut reader, mut writer) = client_with_frame(proxy.addr, ProtoTag::Abridged, &frame, ciphers).await;
        writer.write_packet(b"once", AckFlags::default()).await.unwrap();
        let mut flags = AckFlags::default();
        timeout(WAIT, reader.read_packet(&mut flags)).await.unwrap().unwrap();

        // Same bytes again on a new connection.
        let mut replay = TcpStream::connect(proxy.addr).await.unwrap();
        replay.write_all(&frame).await.unwrap();
        assert!(closed_by_peer(&mut replay).await);

        assert_eq!(dc.accepted.load(Ordering::SeqCst), 1);
        let snap = proxy.ctx.stats.snapshot();
        assert_eq!(snap.replays_detected, 1);
        assert_eq!(snap.connects_bad, 1);
    }

    #[tokio::test]
    async fn test_garbage_handshake_closed_silently() {
        let dc = spawn_fake_dc(None).await;
        let proxy = start_proxy(direct_config(dc.addr), None).await;

        let mut scanner = TcpStream::connect(proxy.addr).await.unwrap();
        scanner.write_all(&[0x16; HANDSHAKE_LEN]).await.unwrap();
        assert!(closed_by_peer(&mut scanner).await);
        assert_eq!(dc.accepted.load(Ordering::SeqCst), 0);
        assert_eq!(proxy.ctx.stats.snapshot().connects_bad, 1);
    }

    #[tokio::test]
    async fn test_admission_gate_drops_excess() {
        let dc = spawn_fake_dc(None).await;
        let mut cfg = direct_config(dc.addr);
        cfg.general.max_connections = 1;
        let proxy = start_proxy(cfg, None).await;

        let (mut reader, mut writer) = connect_client(proxy.addr, ProtoTag::Abridged, 2).await;
        writer.write_packet(b"keep", AckFlags::default()).await.unwrap();
        let mut flags = AckFlags::default();
        timeout(WAIT, reader.read_packet(&mut flags)).await.unwrap().unwrap();

        let mut second = TcpStream::connect(proxy.addr).await.unwrap();
        assert!(closed_by_peer(&mut second).await);
        assert_eq!(proxy.ctx.stats.snapshot().connects_all, 1);
    }

    async fn middle_proxy_setup() -> (
        RunningProxy,
        crate::transport::middle_proxy::pool::test_support::FakeMiddleEnd,
    ) {
        let fake = spawn_fake_middle_end(PROXY_SECRET.to_vec()).await;
        let mut cfg = ProxyConfig::default();
        cfg.access.secret = SECRET_HEX.into();
        cfg.general.use_middle_proxy = true;
        cfg.general.ad_tag = Some(AD_TAG_HEX.into());
        cfg.middle_proxy.overrides.insert("2".into(), fake.addr.to_string());

        let pool = MePool::from_config(
            &cfg,
            PROXY_SECRET.to_vec(),
            Arc::new(Stats::new()),
            Arc::new(SecureRandom::new()),
        )
        .unwrap();
        (start_proxy(cfg, Some(pool)).await, fake)
    }

    #[tokio::test]
    async fn test_middle_proxy_round_trip_and_ack() {
        let (proxy, fake) = middle_proxy_setup().await;
        let (mut reader, mut writer) = connect_client(proxy.addr, ProtoTag::Intermediate, 2).await;
        let mut flags = AckFlags::default();

        writer.write_packet(b"hello world!", AckFlags::default()).await.unwrap();
        let echoed = timeout(WAIT, reader.read_packet(&mut flags)).await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"hello world!");
        assert_eq!(
            fake.ad_tags.lock().first().cloned(),
            Some(Some(hex::decode(AD_TAG_HEX).unwrap()))
        );

        // A simple ack is written bare, without a length header.
        writer.write_packet(b"ack!", AckFlags::default()).await.unwrap();
        let mut raw = reader.into_inner();
        let mut confirm = [0u8; 4];
        timeout(WAIT, raw.read_exact(&mut confirm)).await.unwrap().unwrap();
        assert_eq!(confirm, FAKE_ACK_CONFIRM.to_le_bytes());
    }

    #[tokio::test]
    async fn test_middle_end_close_ends_session() {
        let (proxy, fake) = middle_proxy_setup().await;
        let (mut reader, mut writer) = connect_client(proxy.addr, ProtoTag::Secure, 2).await;

        writer.write_packet(b"bye!", AckFlags::default()).await.unwrap();
        let mut flags = AckFlags::default();
        let res = timeout(WAIT, reader.read_packet(&mut flags)).await.unwrap();
        assert!(res.is_err());
        assert!(fake.closes.lock().is_empty());
        drop(proxy);
    }

    #[tokio::test]
    async fn test_client_close_sends_close_ext() {
        let (proxy, fake) = middle_proxy_setup().await;
        let (mut reader, mut writer) = connect_client(proxy.addr, ProtoTag::Abridged, 2).await;

        writer.write_packet(b"data", AckFlags::default()).await.unwrap();
        let mut flags = AckFlags::default();
        timeout(WAIT, reader.read_packet(&mut flags)).await.unwrap().unwrap();
        writer.shutdown().await.unwrap();

        let pool = proxy.ctx.me_pool.clone().unwrap();
        timeout(WAIT, async {
            while fake.closes.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(fake.closes.lock().len(), 1);
        assert!(pool.registry().is_empty());
    }
}
