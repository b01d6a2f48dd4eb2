//! Obfuscated2 handshake frame codec
//!
//! Both legs of a session open with a 64-byte frame:
//! `[random(8) | key(32) | iv(16) | magic(4) | dc(2) | reserved(2)]`.
//! Bytes `0..56` travel in clear, the magic/dc tail is encrypted with the
//! keystream derived from the frame itself.

use zeroize::Zeroize;

use super::constants::*;
use crate::crypto::{sha256, sha256_parts, AesCtr, SecureRandom};
use crate::error::{ProxyError, Result};

/// Length of a handshake fingerprint kept by the anti-replay cache.
pub const FINGERPRINT_LEN: usize = 16;

pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// The two keystreams of one obfuscated leg.
#[derive(Debug)]
pub struct CipherPair {
    /// Outbound direction
    pub encryptor: AesCtr,
    /// Inbound direction
    pub decryptor: AesCtr,
}

/// Key material recovered from a handshake frame.
///
/// Key material is zeroized on drop.
#[derive(Debug, Clone)]
pub struct ObfuscationParams {
    pub decrypt_key: [u8; 32],
    pub decrypt_iv: u128,
    pub encrypt_key: [u8; 32],
    pub encrypt_iv: u128,
    pub proto_tag: ProtoTag,
    pub dc_idx: i16,
}

impl Drop for ObfuscationParams {
    fn drop(&mut self) {
        self.decrypt_key.zeroize();
        self.decrypt_iv.zeroize();
        self.encrypt_key.zeroize();
        self.encrypt_iv.zeroize();
    }
}

impl ObfuscationParams {
    /// Recover keys, tag and DC from a received frame.
    ///
    /// With `secret` the keys are hashed with it (what a proxy does with a
    /// client frame); with `None` the raw key region is used (what a Telegram
    /// endpoint does with a proxy-originated frame).
    pub fn from_frame(frame: &[u8; HANDSHAKE_LEN], secret: Option<&[u8]>) -> Result<Self> {
        let region = &frame[SKIP_LEN..SKIP_LEN + PREKEY_LEN + IV_LEN];
        let inverted: Vec<u8> = region.iter().rev().copied().collect();

        let (decrypt_key, decrypt_iv) = derive_key_iv(region, secret);
        let (encrypt_key, encrypt_iv) = derive_key_iv(&inverted, secret);

        let mut decryptor = AesCtr::new(&decrypt_key, decrypt_iv);
        let mut plain = *frame;
        decryptor.apply(&mut plain);

        let tag_bytes = read4(&plain, PROTO_TAG_POS);
        let proto_tag = ProtoTag::from_bytes(tag_bytes).ok_or(ProxyError::InvalidProtoTag(tag_bytes))?;
        let dc_idx = i16::from_le_bytes([plain[DC_IDX_POS], plain[DC_IDX_POS + 1]]);
        plain.zeroize();

        Ok(Self {
            decrypt_key,
            decrypt_iv,
            encrypt_key,
            encrypt_iv,
            proto_tag,
            dc_idx,
        })
    }

    pub fn create_decryptor(&self) -> AesCtr {
        AesCtr::new(&self.decrypt_key, self.decrypt_iv)
    }

    pub fn create_encryptor(&self) -> AesCtr {
        AesCtr::new(&self.encrypt_key, self.encrypt_iv)
    }

    /// Ciphers for the stream that follows the frame. The decryptor has
    /// already consumed the 64 frame bytes.
    pub fn cipher_pair(&self) -> CipherPair {
        let mut decryptor = self.create_decryptor();
        let mut skip = [0u8; HANDSHAKE_LEN];
        decryptor.apply(&mut skip);
        CipherPair {
            encryptor: self.create_encryptor(),
            decryptor,
        }
    }
}

/// Parsed client handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    pub ciphers: CipherPair,
    pub proto_tag: ProtoTag,
    pub dc_idx: i16,
    pub fingerprint: Fingerprint,
}

/// Validate and decode a client frame with the 16-byte user secret.
pub fn parse_client_frame(secret: &[u8], frame: &[u8]) -> Result<ClientHandshake> {
    if secret.len() != SECRET_LEN {
        return Err(ProxyError::InvalidHandshake(format!(
            "secret must be {SECRET_LEN} bytes, got {}",
            secret.len()
        )));
    }
    let frame: &[u8; HANDSHAKE_LEN] = frame.try_into().map_err(|_| {
        ProxyError::InvalidHandshake(format!("frame must be {HANDSHAKE_LEN} bytes, got {}", frame.len()))
    })?;

    let params = ObfuscationParams::from_frame(frame, Some(secret))?;
    Ok(ClientHandshake {
        ciphers: params.cipher_pair(),
        proto_tag: params.proto_tag,
        dc_idx: params.dc_idx,
        fingerprint: fingerprint(frame),
    })
}

/// Replay fingerprint: first 16 bytes of SHA-256 over the wire bytes
/// `8..64` of the frame.
pub fn fingerprint(frame: &[u8; HANDSHAKE_LEN]) -> Fingerprint {
    let digest = sha256(&frame[SKIP_LEN..]);
    let mut fp = [0u8; FINGERPRINT_LEN];
    fp.copy_from_slice(&digest[..FINGERPRINT_LEN]);
    fp
}

/// Build the frame the proxy sends to a Telegram endpoint.
///
/// Returns the proxy's ciphers for that leg (encryptor positioned after the
/// frame) and the wire bytes.
pub fn make_server_frame(
    rng: &SecureRandom,
    proto_tag: ProtoTag,
    dc_idx: i16,
) -> (CipherPair, [u8; HANDSHAKE_LEN]) {
    build_frame(rng, proto_tag, dc_idx, None)
}

/// Build the frame a client sends to this proxy for `secret`.
#[cfg(test)]
pub fn make_client_frame(
    rng: &SecureRandom,
    proto_tag: ProtoTag,
    dc_idx: i16,
    secret: &[u8],
) -> (CipherPair, [u8; HANDSHAKE_LEN]) {
    build_frame(rng, proto_tag, dc_idx, Some(secret))
}

fn build_frame(
    rng: &SecureRandom,
    proto_tag: ProtoTag,
    dc_idx: i16,
    secret: Option<&[u8]>,
) -> (CipherPair, [u8; HANDSHAKE_LEN]) {
    let mut frame = generate_nonce(rng);
    frame[PROTO_TAG_POS..PROTO_TAG_POS + 4].copy_from_slice(&proto_tag.to_bytes());
    frame[DC_IDX_POS..DC_IDX_POS + 2].copy_from_slice(&dc_idx.to_le_bytes());

    let region = &frame[SKIP_LEN..SKIP_LEN + PREKEY_LEN + IV_LEN];
    let inverted: Vec<u8> = region.iter().rev().copied().collect();
    let (mut enc_key, enc_iv) = derive_key_iv(region, secret);
    let (mut dec_key, dec_iv) = derive_key_iv(&inverted, secret);

    let mut encryptor = AesCtr::new(&enc_key, enc_iv);
    let decryptor = AesCtr::new(&dec_key, dec_iv);
    enc_key.zeroize();
    dec_key.zeroize();

    let mut encrypted = frame;
    encryptor.apply(&mut encrypted);
    frame[PROTO_TAG_POS..].copy_from_slice(&encrypted[PROTO_TAG_POS..]);

    (CipherPair { encryptor, decryptor }, frame)
}

/// Random frame prefix that cannot be mistaken for another protocol.
pub fn generate_nonce(rng: &SecureRandom) -> [u8; HANDSHAKE_LEN] {
    loop {
        let nonce = rng.array::<HANDSHAKE_LEN>();
        if is_valid_nonce(&nonce) {
            return nonce;
        }
    }
}

pub fn is_valid_nonce(nonce: &[u8; HANDSHAKE_LEN]) -> bool {
    if RESERVED_NONCE_FIRST_BYTES.contains(&nonce[0]) {
        return false;
    }
    if RESERVED_NONCE_BEGINNINGS.contains(&read4(nonce, 0)) {
        return false;
    }
    !RESERVED_NONCE_CONTINUES.contains(&read4(nonce, 4))
}

fn derive_key_iv(key_iv: &[u8], secret: Option<&[u8]>) -> ([u8; 32], u128) {
    let prekey = &key_iv[..PREKEY_LEN];
    let key = match secret {
        Some(secret) => sha256_parts(&[prekey, secret]),
        None => {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(prekey);
            key
        }
    };
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&key_iv[PREKEY_LEN..PREKEY_LEN + IV_LEN]);
    (key, u128::from_be_bytes(iv))
}

fn read4(buf: &[u8], pos: usize) -> [u8; 4] {
    [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]
}
