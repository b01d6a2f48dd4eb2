//! Per-connection middle-end reader task

use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::{debug, trace, warn};

use super::codec::RpcReader;
use super::pool::MeConnShared;
use super::registry::{ConnRegistry, MeResponse};
use crate::error::{ProxyError, Result};
use crate::protocol::rpc::{build_pong, RpcMessage};

/// Route responses by conn_id until the connection ends or is cancelled.
pub(super) async fn reader_loop<R>(
    mut reader: RpcReader<R>,
    conn: Arc<MeConnShared>,
    registry: Arc<ConnRegistry>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let payload = tokio::select! {
            _ = conn.cancel.cancelled() => return Ok(()),
            r = reader.read_frame() => r?,
        };

        match RpcMessage::parse(payload) {
            RpcMessage::ProxyAns { flags, conn_id, data } => {
                trace!(conn_id, len = data.len(), flags, "ANS");
                registry.route(conn_id, MeResponse::Data(data));
            }
            RpcMessage::SimpleAck { conn_id, confirm } => {
                trace!(conn_id, confirm, "ACK");
                registry.route(conn_id, MeResponse::Ack(confirm));
            }
            RpcMessage::CloseExt { conn_id } | RpcMessage::CloseConn { conn_id } => {
                debug!(conn_id, "Close from middle-end");
                registry.route(conn_id, MeResponse::Close);
                registry.unregister(conn_id);
            }
            RpcMessage::Ping { ping_id } => {
                trace!(ping_id, "PING -> PONG");
                conn.send(&build_pong(ping_id)).await?;
            }
            RpcMessage::Unknown { tag, len } => {
                debug!(rpc_type = format_args!("0x{tag:08x}"), len, "Unknown RPC dropped");
            }
        }
    }
}

/// Run the reader, then close every session that wrote through this
/// connection: their answers can no longer arrive.
pub(super) async fn run_reader<R>(reader: RpcReader<R>, conn: Arc<MeConnShared>, registry: Arc<ConnRegistry>)
where
    R: AsyncRead + Unpin,
{
    match reader_loop(reader, conn.clone(), registry.clone()).await {
        Ok(()) => debug!(addr = %conn.addr, "Middle-end reader stopped"),
        Err(ProxyError::StreamClosed(_)) => debug!(addr = %conn.addr, "Middle-end closed connection"),
        Err(e) => warn!(addr = %conn.addr, error = %e, "Middle-end reader ended"),
    }
    conn.mark_dead();

    let ids = conn.take_writers();
    for id in ids {
        registry.route(id, MeResponse::Close);
    }
}
