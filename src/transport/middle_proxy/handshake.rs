//! Middle-end connection handshake: nonce exchange, key derivation,
//! encrypted RPC handshake

use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::codec::{read_rpc_frame_plaintext, write_rpc_frame_plaintext, RpcReader, RpcWriter};
use crate::crypto::{derive_middleproxy_keys, SecureRandom};
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;
use crate::protocol::rpc::{
    build_handshake_payload, build_nonce_payload, check_handshake_payload, parse_nonce_payload,
};

/// Key selector announced in the nonce: the first four secret bytes, LE.
pub fn key_selector(proxy_secret: &[u8]) -> u32 {
    match proxy_secret {
        [a, b, c, d, ..] => u32::from_le_bytes([*a, *b, *c, *d]),
        _ => 0,
    }
}

/// The address material both ends feed into key derivation.
#[derive(Debug, Clone, Copy)]
pub struct KeyAddrs {
    /// The proxy side of the TCP connection
    pub client: SocketAddr,
    /// The middle-end side
    pub server: SocketAddr,
}

impl KeyAddrs {
    /// Derive the key and IV for one direction (`CLIENT` = proxy writes,
    /// `SERVER` = proxy reads).
    pub fn derive(
        &self,
        purpose: &[u8; 6],
        nonce_srv: &[u8; 16],
        nonce_clt: &[u8; 16],
        crypto_ts: u32,
        secret: &[u8],
    ) -> ([u8; 32], [u8; 16]) {
        let ts = crypto_ts.to_le_bytes();
        let clt_port = self.client.port().to_le_bytes();
        let srv_port = self.server.port().to_le_bytes();

        match (v4_word(self.client.ip()), v4_word(self.server.ip())) {
            (Some(clt), Some(srv)) => derive_middleproxy_keys(
                nonce_srv,
                nonce_clt,
                &ts,
                Some(&srv),
                &clt_port,
                purpose,
                Some(&clt),
                &srv_port,
                secret,
                None,
                None,
            ),
            _ => {
                let clt6 = v6_octets(self.client.ip());
                let srv6 = v6_octets(self.server.ip());
                derive_middleproxy_keys(
                    nonce_srv,
                    nonce_clt,
                    &ts,
                    None,
                    &clt_port,
                    purpose,
                    None,
                    &srv_port,
                    secret,
                    Some(&clt6),
                    Some(&srv6),
                )
            }
        }
    }
}

/// IPv4 address as the little-endian encoding of its big-endian word,
/// i.e. the octets reversed.
fn v4_word(ip: IpAddr) -> Option<[u8; 4]> {
    let v4 = match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
    };
    Some(u32::from_be_bytes(v4.octets()).to_le_bytes())
}

fn v6_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn unix_ts() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Replace the local IPv4 with the configured public one.
pub fn apply_nat(local: SocketAddr, nat_ip: Option<IpAddr>) -> SocketAddr {
    match (local.ip(), nat_ip) {
        (IpAddr::V4(_), Some(nat @ IpAddr::V4(_))) => SocketAddr::new(nat, local.port()),
        _ => local,
    }
}

/// Run the proxy side of the handshake over a fresh connection.
///
/// Returns the encrypted reader and writer, both positioned at sequence 0.
pub async fn client_handshake<R, W>(
    mut rd: R,
    mut wr: W,
    addrs: KeyAddrs,
    proxy_secret: &[u8],
    rng: &SecureRandom,
) -> Result<(RpcReader<R>, RpcWriter<W>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if proxy_secret.len() < 32 {
        return Err(ProxyError::Config("proxy-secret too short for middle-end auth".into()));
    }

    let ks = key_selector(proxy_secret);
    let my_nonce: [u8; 16] = rng.array();
    let crypto_ts = unix_ts();

    write_rpc_frame_plaintext(&mut wr, RPC_SEQ_NONCE, &build_nonce_payload(ks, crypto_ts, &my_nonce))
        .await?;

    let (seq, payload) = read_rpc_frame_plaintext(&mut rd).await?;
    if seq != RPC_SEQ_NONCE {
        return Err(ProxyError::InvalidHandshake(format!("expected seq={RPC_SEQ_NONCE}, got {seq}")));
    }
    let srv = parse_nonce_payload(&payload)?;
    if srv.crypto_schema != RPC_CRYPTO_AES_U32 {
        return Err(ProxyError::InvalidHandshake(format!(
            "unsupported crypto schema 0x{:x}",
            srv.crypto_schema
        )));
    }
    if srv.key_selector != ks {
        return Err(ProxyError::InvalidHandshake(format!(
            "key selector mismatch: 0x{:08x} vs 0x{ks:08x}",
            srv.key_selector
        )));
    }

    let (wk, wi) = addrs.derive(b"CLIENT", &srv.nonce, &my_nonce, crypto_ts, proxy_secret);
    let (rk, ri) = addrs.derive(b"SERVER", &srv.nonce, &my_nonce, crypto_ts, proxy_secret);
    debug!(server = %addrs.server, write_key = %hex::encode(&wk[..4]), "Middle-end keys derived");

    let mut writer = RpcWriter::new(wr, wk, wi, RPC_SEQ_HANDSHAKE);
    let mut reader = RpcReader::new(rd, rk, ri, RPC_SEQ_HANDSHAKE);

    writer.send(&build_handshake_payload()).await?;
    let answer = reader.read_frame().await?;
    check_handshake_payload(&answer)?;

    Ok((reader, writer))
}
