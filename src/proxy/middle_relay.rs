//! Middle-proxy mode: client packets in RPC envelopes over the shared pool
//!
//! ```text
//!   client <-CTR+framing-> [mtrelay] <-RPC/CBC-> middle-end <-> DC
//! ```
//!
//! The client leg keeps the framing its tag selected. Each packet read from
//! the client becomes one `RPC_PROXY_REQ`; answers come back through the
//! session's registry channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::context::ProxyContext;
use super::handshake::HandshakeSuccess;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;
use crate::protocol::rpc::ProxyReqHeader;
use crate::stats::Stats;
use crate::stream::{AckFlags, CryptoReader, CryptoWriter, FramedReader, FramedWriter};
use crate::transport::middle_proxy::handshake::apply_nat;
use crate::transport::middle_proxy::{IpFamily, MePool, MeResponse};

/// Addressing shared by every envelope of one session.
#[derive(Debug, Clone, Copy)]
struct Route {
    conn_id: u64,
    family: IpFamily,
    dc: i16,
    client_addr: SocketAddr,
    our_addr: SocketAddr,
    proto_tag: ProtoTag,
    ad_tag: Option<[u8; AD_TAG_LEN]>,
}

pub async fn handle_via_middle_proxy<R, W>(
    client_reader: CryptoReader<R>,
    client_writer: CryptoWriter<W>,
    success: HandshakeSuccess,
    local_addr: SocketAddr,
    pool: Arc<MePool>,
    ctx: &ProxyContext,
    config: &ProxyConfig,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let ad_tag = config.ad_tag()?;
    let (conn_id, me_rx) = pool.registry().register(&ctx.rng);
    let route = Route {
        conn_id,
        family: IpFamily::of(&success.peer),
        dc: success.dc_idx,
        client_addr: success.peer,
        our_addr: apply_nat(local_addr, config.middle_proxy.nat_ip),
        proto_tag: success.proto_tag,
        ad_tag,
    };
    debug!(
        peer = %success.peer,
        conn_id,
        dc = route.dc,
        family = ?route.family,
        "Middle-end session registered"
    );

    let cancel = CancellationToken::new();
    let c2me = tokio::spawn(client_to_me(
        FramedReader::new(client_reader, success.proto_tag),
        route,
        pool.clone(),
        config.timeouts.relay_idle(),
        cancel.clone(),
        ctx.stats.clone(),
    ));
    let me2c = tokio::spawn(me_to_client(
        FramedWriter::new(client_writer, success.proto_tag, ctx.rng.clone()),
        me_rx,
        conn_id,
        config.timeouts.me_response(),
        cancel.clone(),
        ctx.stats.clone(),
    ));

    let (c2me, me2c) = tokio::join!(c2me, me2c);
    let c2me = flatten(c2me);
    let me2c = flatten(me2c);

    // The answer direction only reports StreamClosed when the middle-end
    // closed the session; otherwise it ended here and the middle-end is told.
    if matches!(me2c, Err(ProxyError::StreamClosed(_))) {
        pool.registry().unregister(conn_id);
    } else if let Err(e) = pool.send_close(route.family, route.dc, conn_id).await {
        debug!(conn_id, error = %e, "Failed to send close to middle-end");
    }

    debug!(conn_id, c2me = ?c2me.as_ref().err(), me2c = ?me2c.as_ref().err(), "Middle-end session finished");
    c2me?;
    match me2c {
        Err(ProxyError::StreamClosed(_)) => Ok(()),
        other => other,
    }
}

fn flatten(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(r) => r,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(ProxyError::StreamClosed("relay task cancelled".into())),
    }
}

async fn client_to_me<R>(
    mut reader: FramedReader<R>,
    route: Route,
    pool: Arc<MePool>,
    idle: Duration,
    cancel: CancellationToken,
    stats: Arc<Stats>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut flags = AckFlags::default();
    let res = loop {
        flags.reset();
        let packet = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            r = timeout(idle, reader.read_packet(&mut flags)) => match r {
                Err(_) => break Err(ProxyError::IdleTimeout("C->ME")),
                Ok(Err(ProxyError::StreamClosed(_))) => {
                    trace!(conn_id = route.conn_id, "Client EOF");
                    break Ok(());
                }
                Ok(Err(e)) => break Err(e),
                Ok(Ok(p)) => p,
            },
        };

        let hdr = ProxyReqHeader {
            conn_id: route.conn_id,
            client_addr: route.client_addr,
            our_addr: route.our_addr,
            proto_tag: route.proto_tag,
            ad_tag: route.ad_tag.as_ref(),
            quick_ack: flags.quick_ack,
        };
        trace!(conn_id = route.conn_id, len = packet.len(), quick_ack = flags.quick_ack, "C->ME");
        if let Err(e) = pool.send_proxy_req(route.family, route.dc, &hdr, &packet).await {
            break Err(e);
        }
        stats.add_octets_from_client(packet.len() as u64);
    };
    cancel.cancel();
    res
}

async fn me_to_client<W>(
    mut writer: FramedWriter<W>,
    mut rx: mpsc::Receiver<MeResponse>,
    conn_id: u64,
    wait: Duration,
    cancel: CancellationToken,
    stats: Arc<Stats>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut flags = AckFlags::default();
    let res = loop {
        flags.reset();
        let resp = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            r = timeout(wait, rx.recv()) => match r {
                Err(_) => break Err(ProxyError::MeResponseTimeout),
                Ok(None) => break Err(ProxyError::StreamClosed("middle-end session dropped".into())),
                Ok(Some(resp)) => resp,
            },
        };

        let written = match resp {
            MeResponse::Data(data) => write_data(&mut writer, &data, flags, &stats).await,
            MeResponse::Ack(confirm) => {
                trace!(conn_id, confirm, "ME->C simple ack");
                flags.simple_ack = true;
                writer.write_packet(&confirm.to_le_bytes(), flags).await
            }
            MeResponse::Close => break Err(ProxyError::StreamClosed("closed by middle-end".into())),
        };
        if let Err(e) = written {
            break Err(e);
        }
    };
    cancel.cancel();
    let _ = writer.shutdown().await;
    res
}

async fn write_data<W>(writer: &mut FramedWriter<W>, data: &Bytes, flags: AckFlags, stats: &Stats) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_packet(data, flags).await?;
    stats.add_octets_to_client(data.len() as u64);
    Ok(())
}
