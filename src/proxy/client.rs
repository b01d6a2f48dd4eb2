//! Client session: handshake, mode dispatch, teardown

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::context::ProxyContext;
use super::direct_relay::handle_via_direct;
use super::handshake::handle_client_handshake;
use super::middle_relay::handle_via_middle_proxy;
use crate::error::{HandshakeResult, ProxyError, Result};

/// Where a session is in its life. States only move forward; any failure
/// ends the session wherever it stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Accepted,
    HandshakeRead,
    HandshakeValidated,
    CipherEstablished,
    AntiReplayChecked,
    FramingSelected,
    Relaying,
    Closed,
}

impl SessionState {
    pub fn advance(&mut self, next: SessionState) {
        debug_assert!(next >= *self, "session state went back: {self} -> {next}");
        trace!(from = %self, to = %next, "Session state");
        *self = next;
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Accepted => "accepted",
            SessionState::HandshakeRead => "handshake-read",
            SessionState::HandshakeValidated => "handshake-validated",
            SessionState::CipherEstablished => "cipher-established",
            SessionState::AntiReplayChecked => "anti-replay-checked",
            SessionState::FramingSelected => "framing-selected",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        })
    }
}

/// Run one accepted connection to completion.
///
/// Rejected handshakes end with `Ok(())`: the socket is dropped without a
/// reply and the attempt is only counted.
pub async fn handle_client(stream: TcpStream, peer: SocketAddr, ctx: Arc<ProxyContext>) -> Result<()> {
    let stats = ctx.stats.clone();
    stats.increment_connects_all();
    let _live = stats.session_guard();

    let config = ctx.snapshot();
    let local = stream.local_addr()?;
    let mut state = SessionState::Accepted;
    debug!(peer = %peer, "New connection");

    let (read_half, write_half) = stream.into_split();
    let handshake = timeout(
        config.timeouts.client_handshake(),
        handle_client_handshake(read_half, write_half, peer, &ctx.secret, &ctx.replay, &stats, &mut state),
    )
    .await;

    let (client_reader, client_writer, success) = match handshake {
        Ok(HandshakeResult::Success(parts)) => parts,
        Ok(HandshakeResult::BadClient { reader, writer }) => {
            stats.increment_connects_bad();
            debug!(peer = %peer, state = %state, "Bad client, closing silently");
            drop((reader, writer));
            return Ok(());
        }
        Ok(HandshakeResult::Error(e)) => {
            debug!(peer = %peer, state = %state, error = %e, "Handshake failed");
            return Err(e);
        }
        Err(_) => {
            stats.increment_handshake_timeouts();
            debug!(peer = %peer, state = %state, "Handshake timeout");
            return Err(ProxyError::IdleTimeout("client handshake"));
        }
    };
    state.advance(SessionState::FramingSelected);

    let me_pool = match (config.general.use_middle_proxy, &ctx.me_pool) {
        (true, Some(pool)) => Some(pool.clone()),
        (true, None) => {
            warn!("use_middle_proxy is set but no middle-end pool is running, using direct mode");
            None
        }
        (false, _) => None,
    };

    info!(
        peer = %peer,
        dc = success.dc_idx,
        proto = success.proto_tag.name(),
        mode = if me_pool.is_some() { "middle_proxy" } else { "direct" },
        "Client authenticated"
    );

    state.advance(SessionState::Relaying);
    let result = match me_pool {
        Some(pool) => {
            handle_via_middle_proxy(client_reader, client_writer, success, local, pool, &ctx, &config).await
        }
        None => handle_via_direct(client_reader, client_writer, success, &ctx, &config).await,
    };
    state.advance(SessionState::Closed);

    match &result {
        Ok(()) => debug!(peer = %peer, "Session finished"),
        Err(e) => debug!(peer = %peer, error = %e, "Session ended with error"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_are_ordered() {
        let mut s = SessionState::Accepted;
        s.advance(SessionState::HandshakeRead);
        s.advance(SessionState::AntiReplayChecked);
        s.advance(SessionState::Closed);
        assert_eq!(s, SessionState::Closed);
        assert!(SessionState::CipherEstablished < SessionState::AntiReplayChecked);
        assert_eq!(SessionState::FramingSelected.to_string(), "framing-selected");
    }
}
