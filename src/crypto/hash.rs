//! Hash helpers and the middle-end key schedule

use ::md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 over several slices without concatenating them first.
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Derive an AES-256-CBC key and IV for one direction of a middle-end
/// connection.
///
/// `purpose` is `b"CLIENT"` for the proxy's write direction and `b"SERVER"`
/// for its read direction. IPv4 addresses are passed as the little-endian
/// encoding of the address word; when a side is IPv6, pass `None` for the v4
/// slots and both 16-byte addresses in the trailing slots.
#[allow(clippy::too_many_arguments)]
pub fn derive_middleproxy_keys(
    nonce_srv: &[u8; 16],
    nonce_clt: &[u8; 16],
    clt_ts: &[u8; 4],
    srv_ip: Option<&[u8]>,
    clt_port: &[u8; 2],
    purpose: &[u8; 6],
    clt_ip: Option<&[u8]>,
    srv_port: &[u8; 2],
    secret: &[u8],
    clt_ipv6: Option<&[u8; 16]>,
    srv_ipv6: Option<&[u8; 16]>,
) -> ([u8; 32], [u8; 16]) {
    const ZERO_IP: [u8; 4] = [0; 4];

    let mut s = Vec::with_capacity(128 + secret.len());
    s.extend_from_slice(nonce_srv);
    s.extend_from_slice(nonce_clt);
    s.extend_from_slice(clt_ts);
    s.extend_from_slice(srv_ip.unwrap_or(&ZERO_IP));
    s.extend_from_slice(clt_port);
    s.extend_from_slice(purpose);
    s.extend_from_slice(clt_ip.unwrap_or(&ZERO_IP));
    s.extend_from_slice(srv_port);
    s.extend_from_slice(secret);
    s.extend_from_slice(nonce_srv);
    if let (Some(c6), Some(s6)) = (clt_ipv6, srv_ipv6) {
        s.extend_from_slice(c6);
        s.extend_from_slice(s6);
    }
    s.extend_from_slice(nonce_clt);

    let md5_1 = md5(&s[1..]);
    let sha1_sum = sha1(&s);
    let md5_2 = md5(&s[2..]);

    let mut key = [0u8; 32];
    key[..12].copy_from_slice(&md5_1[..12]);
    key[12..].copy_from_slice(&sha1_sum);

    (key, md5_2)
}
