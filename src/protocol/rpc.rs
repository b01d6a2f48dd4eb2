//! Middle-end RPC payloads
//!
//! Everything here is the body of one RPC frame (the part between the
//! sequence number and the CRC). Framing and encryption live in
//! `transport::middle_proxy::codec`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;

use super::constants::*;
use crate::error::{ProxyError, Result};

// ========== Nonce ==========

pub const NONCE_PAYLOAD_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcNonce {
    pub key_selector: u32,
    pub crypto_schema: u32,
    pub crypto_ts: u32,
    pub nonce: [u8; 16],
}

pub fn build_nonce_payload(key_selector: u32, crypto_ts: u32, nonce: &[u8; 16]) -> [u8; NONCE_PAYLOAD_LEN] {
    let mut p = [0u8; NONCE_PAYLOAD_LEN];
    p[0..4].copy_from_slice(&RPC_NONCE_U32.to_le_bytes());
    p[4..8].copy_from_slice(&key_selector.to_le_bytes());
    p[8..12].copy_from_slice(&RPC_CRYPTO_AES_U32.to_le_bytes());
    p[12..16].copy_from_slice(&crypto_ts.to_le_bytes());
    p[16..32].copy_from_slice(nonce);
    p
}

pub fn parse_nonce_payload(d: &[u8]) -> Result<RpcNonce> {
    if d.len() < NONCE_PAYLOAD_LEN {
        return Err(ProxyError::InvalidHandshake(format!(
            "nonce payload too short: {} bytes",
            d.len()
        )));
    }
    let tag = le_u32(d, 0);
    if tag != RPC_NONCE_U32 {
        return Err(ProxyError::InvalidHandshake(format!(
            "expected RPC_NONCE 0x{RPC_NONCE_U32:08x}, got 0x{tag:08x}"
        )));
    }
    let mut nonce = [0u8; 16];
    nonce.copy_from_slice(&d[16..32]);
    Ok(RpcNonce {
        key_selector: le_u32(d, 4),
        crypto_schema: le_u32(d, 8),
        crypto_ts: le_u32(d, 12),
        nonce,
    })
}

// ========== Handshake ==========

pub const HANDSHAKE_PAYLOAD_LEN: usize = 32;

/// `tag | flags(0) | sender_pid(12) | peer_pid(12)`
pub fn build_handshake_payload() -> [u8; HANDSHAKE_PAYLOAD_LEN] {
    let mut p = [0u8; HANDSHAKE_PAYLOAD_LEN];
    p[0..4].copy_from_slice(&RPC_HANDSHAKE_U32.to_le_bytes());
    p[8..20].copy_from_slice(RPC_HANDSHAKE_PID);
    p[20..32].copy_from_slice(RPC_HANDSHAKE_PID);
    p
}

/// Accept a handshake answer whose peer pid echoes our sender pid.
pub fn check_handshake_payload(d: &[u8]) -> Result<()> {
    if d.len() < 4 {
        return Err(ProxyError::InvalidHandshake("empty RPC handshake answer".into()));
    }
    match le_u32(d, 0) {
        RPC_HANDSHAKE_ERROR_U32 => {
            let code = if d.len() >= 8 { le_u32(d, 4) as i32 } else { -1 };
            Err(ProxyError::UpstreamUnavailable(format!(
                "middle-end rejected handshake (error={code})"
            )))
        }
        RPC_HANDSHAKE_U32 => {
            if d.len() < HANDSHAKE_PAYLOAD_LEN {
                return Err(ProxyError::InvalidHandshake(format!(
                    "RPC handshake answer too short: {} bytes",
                    d.len()
                )));
            }
            if &d[20..32] != RPC_HANDSHAKE_PID {
                return Err(ProxyError::InvalidHandshake("RPC handshake pid mismatch".into()));
            }
            Ok(())
        }
        other => Err(ProxyError::InvalidHandshake(format!(
            "expected RPC_HANDSHAKE 0x{RPC_HANDSHAKE_U32:08x}, got 0x{other:08x}"
        ))),
    }
}

// ========== Proxy request ==========

/// Transport flags for a client's framing. The per-packet bits
/// (`NOT_ENCRYPTED`, `QUICKACK`) are added by [`build_proxy_req`].
pub fn proto_flags_for_tag(tag: ProtoTag, has_ad_tag: bool) -> u32 {
    let mut flags = RPC_FLAG_MAGIC | RPC_FLAG_EXTMODE2;
    if has_ad_tag {
        flags |= RPC_FLAG_HAS_AD_TAG;
    }
    match tag {
        ProtoTag::Abridged => flags | RPC_FLAG_ABRIDGED,
        ProtoTag::Intermediate => flags | RPC_FLAG_INTERMEDIATE,
        ProtoTag::Secure => flags | RPC_FLAG_PAD | RPC_FLAG_INTERMEDIATE,
    }
}

/// Addressing and per-packet options of one `RPC_PROXY_REQ`.
#[derive(Debug, Clone, Copy)]
pub struct ProxyReqHeader<'a> {
    pub conn_id: u64,
    pub client_addr: SocketAddr,
    pub our_addr: SocketAddr,
    pub proto_tag: ProtoTag,
    pub ad_tag: Option<&'a [u8; AD_TAG_LEN]>,
    pub quick_ack: bool,
}

pub fn build_proxy_req(hdr: &ProxyReqHeader<'_>, data: &[u8]) -> Vec<u8> {
    let mut flags = proto_flags_for_tag(hdr.proto_tag, hdr.ad_tag.is_some());
    if data.len() >= 8 && data[..8].iter().all(|&b| b == 0) {
        flags |= RPC_FLAG_NOT_ENCRYPTED;
    }
    if hdr.quick_ack {
        flags |= RPC_FLAG_QUICKACK;
    }

    let mut b = Vec::with_capacity(96 + data.len());
    b.extend_from_slice(&RPC_PROXY_REQ_U32.to_le_bytes());
    b.extend_from_slice(&flags.to_le_bytes());
    b.extend_from_slice(&hdr.conn_id.to_le_bytes());

    push_addr(&mut b, hdr.client_addr);
    push_addr(&mut b, hdr.our_addr);

    if let Some(tag) = hdr.ad_tag {
        let extra_start = b.len();
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&TL_PROXY_TAG_U32.to_le_bytes());
        // TL short string: len(1) | bytes | pad to 4
        b.push(tag.len() as u8);
        b.extend_from_slice(tag);
        let pad = (4 - ((1 + tag.len()) % 4)) % 4;
        b.extend(std::iter::repeat_n(0u8, pad));

        let extra_len = (b.len() - extra_start - 4) as u32;
        b[extra_start..extra_start + 4].copy_from_slice(&extra_len.to_le_bytes());
    }

    b.extend_from_slice(data);
    b
}

pub fn build_close_ext(conn_id: u64) -> [u8; 12] {
    let mut p = [0u8; 12];
    p[0..4].copy_from_slice(&RPC_CLOSE_EXT_U32.to_le_bytes());
    p[4..12].copy_from_slice(&conn_id.to_le_bytes());
    p
}

pub fn build_pong(ping_id: i64) -> [u8; 12] {
    let mut p = [0u8; 12];
    p[0..4].copy_from_slice(&RPC_PONG_U32.to_le_bytes());
    p[4..12].copy_from_slice(&ping_id.to_le_bytes());
    p
}

fn push_addr(b: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => b.extend_from_slice(&ipv4_to_mapped_v6(v4)),
        IpAddr::V6(v6) => b.extend_from_slice(&v6.octets()),
    }
    b.extend_from_slice(&(addr.port() as u32).to_le_bytes());
}

pub fn ipv4_to_mapped_v6(ip: Ipv4Addr) -> [u8; 16] {
    ip.to_ipv6_mapped().octets()
}

// ========== Middle-end messages ==========

/// One message received from a middle-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    ProxyAns { flags: u32, conn_id: u64, data: Bytes },
    SimpleAck { conn_id: u64, confirm: u32 },
    CloseExt { conn_id: u64 },
    CloseConn { conn_id: u64 },
    Ping { ping_id: i64 },
    Unknown { tag: u32, len: usize },
}

impl RpcMessage {
    /// Decode a frame payload. Truncated known messages are reported as
    /// `Unknown` so the caller can log and drop them.
    pub fn parse(payload: Bytes) -> Self {
        let len = payload.len();
        if len < 4 {
            return RpcMessage::Unknown { tag: 0, len };
        }
        let tag = le_u32(&payload, 0);
        let body = &payload[4..];
        match tag {
            RPC_PROXY_ANS_U32 if body.len() >= 12 => RpcMessage::ProxyAns {
                flags: le_u32(body, 0),
                conn_id: le_u64(body, 4),
                data: payload.slice(16..),
            },
            RPC_SIMPLE_ACK_U32 if body.len() >= 12 => RpcMessage::SimpleAck {
                conn_id: le_u64(body, 0),
                confirm: le_u32(body, 8),
            },
            RPC_CLOSE_EXT_U32 if body.len() >= 8 => RpcMessage::CloseExt {
                conn_id: le_u64(body, 0),
            },
            RPC_CLOSE_CONN_U32 if body.len() >= 8 => RpcMessage::CloseConn {
                conn_id: le_u64(body, 0),
            },
            RPC_PING_U32 if body.len() >= 8 => RpcMessage::Ping {
                ping_id: le_u64(body, 0) as i64,
            },
            _ => RpcMessage::Unknown { tag, len },
        }
    }
}

fn le_u32(d: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]])
}

fn le_u64(d: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&d[at..at + 8]);
    u64::from_le_bytes(b)
}
