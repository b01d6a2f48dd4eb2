//! Direct mode: one obfuscated TCP leg to a Telegram DC per client

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::context::ProxyContext;
use super::handshake::HandshakeSuccess;
use super::relay::relay_bidirectional;
use crate::config::ProxyConfig;
use crate::crypto::SecureRandom;
use crate::error::Result;
use crate::protocol::constants::ProtoTag;
use crate::protocol::obfuscation::make_server_frame;
use crate::stream::{CryptoReader, CryptoWriter};

/// Dial the client's DC, open an obfuscated leg with the client's framing
/// and relay raw decrypted bytes between the two legs.
pub async fn handle_via_direct<R, W>(
    client_reader: CryptoReader<R>,
    client_writer: CryptoWriter<W>,
    success: HandshakeSuccess,
    ctx: &ProxyContext,
    config: &ProxyConfig,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let stream = ctx
        .upstream
        .connect(success.dc_idx, config.timeouts.tg_connect())
        .await
        .inspect_err(|_| ctx.stats.increment_upstream_failures())?;
    let dc_addr = stream.peer_addr().ok();

    let (tg_reader, tg_writer) = tg_handshake(stream, success.proto_tag, success.dc_idx, &ctx.rng)
        .await
        .inspect_err(|_| ctx.stats.increment_upstream_failures())?;

    debug!(
        peer = %success.peer,
        dc = success.dc_idx,
        dc_addr = ?dc_addr,
        "Telegram leg established, relaying"
    );

    relay_bidirectional(
        client_reader,
        client_writer,
        tg_reader,
        tg_writer,
        config.timeouts.relay_idle(),
        ctx.stats.clone(),
        ctx.buffer_pool.clone(),
    )
    .await
}

/// Send our own 64-byte frame to the DC and wrap the socket in its ciphers.
pub async fn tg_handshake(
    mut stream: TcpStream,
    proto_tag: ProtoTag,
    dc_idx: i16,
    rng: &SecureRandom,
) -> Result<(CryptoReader<OwnedReadHalf>, CryptoWriter<OwnedWriteHalf>)> {
    let (ciphers, frame) = make_server_frame(rng, proto_tag, dc_idx);
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let (read_half, write_half) = stream.into_split();
    Ok((
        CryptoReader::new(read_half, ciphers.decryptor),
        CryptoWriter::new(write_half, ciphers.encryptor),
    ))
}
