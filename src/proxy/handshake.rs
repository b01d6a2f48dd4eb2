//! Inbound obfuscated2 handshake

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, trace};

use super::client::SessionState;
use crate::config::Secret;
use crate::error::{HandshakeResult, ProxyError, Result};
use crate::protocol::constants::*;
use crate::protocol::obfuscation::{parse_client_frame, ClientHandshake};
use crate::stats::{ReplayChecker, Stats};
use crate::stream::{CryptoReader, CryptoWriter};

/// What the rest of the session needs to know about the client.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeSuccess {
    pub peer: SocketAddr,
    pub proto_tag: ProtoTag,
    pub dc_idx: i16,
}

/// Read and validate the client's 64-byte frame.
///
/// Every rejection (bad magic, wrong secret, disallowed mode, replay) comes
/// back as `BadClient` so the caller drops the socket without answering.
/// `state` records how far the handshake got.
pub async fn handle_client_handshake<R, W>(
    mut reader: R,
    writer: W,
    peer: SocketAddr,
    secret: &Secret,
    replay: &ReplayChecker,
    stats: &Stats,
    state: &mut SessionState,
) -> HandshakeResult<(CryptoReader<R>, CryptoWriter<W>, HandshakeSuccess), R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frame = [0u8; HANDSHAKE_LEN];
    if let Err(e) = reader.read_exact(&mut frame).await {
        return HandshakeResult::Error(e.into());
    }
    state.advance(SessionState::HandshakeRead);

    let hs = match check_frame(&frame, secret, replay, stats, state) {
        Ok(hs) => hs,
        Err(e) if e.is_client_fault() => {
            debug!(peer = %peer, state = %state, error = %e, "Client handshake rejected");
            return HandshakeResult::BadClient { reader, writer };
        }
        Err(e) => return HandshakeResult::Error(e),
    };
    let ClientHandshake {
        ciphers,
        proto_tag,
        dc_idx,
        ..
    } = hs;

    trace!(peer = %peer, dc = dc_idx, proto = proto_tag.name(), "Client handshake accepted");
    HandshakeResult::Success((
        CryptoReader::new(reader, ciphers.decryptor),
        CryptoWriter::new(writer, ciphers.encryptor),
        HandshakeSuccess {
            peer,
            proto_tag,
            dc_idx,
        },
    ))
}

/// Decode the frame and run the acceptance checks in order. `state` moves
/// past every check that passes.
fn check_frame(
    frame: &[u8; HANDSHAKE_LEN],
    secret: &Secret,
    replay: &ReplayChecker,
    stats: &Stats,
    state: &mut SessionState,
) -> Result<ClientHandshake> {
    let hs = parse_client_frame(&secret.bytes, frame)?;

    if secret.secure_only && hs.proto_tag != ProtoTag::Secure {
        return Err(ProxyError::ModeNotAllowed(hs.proto_tag.name().to_string()));
    }
    state.advance(SessionState::HandshakeValidated);
    state.advance(SessionState::CipherEstablished);

    if replay.seen_before(&hs.fingerprint) {
        stats.increment_replays_detected();
        trace!(fingerprint = %hex::encode(&hs.fingerprint[..8]), "Replayed handshake");
        return Err(ProxyError::ReplayDetected);
    }
    state.advance(SessionState::AntiReplayChecked);
    Ok(hs)
}
