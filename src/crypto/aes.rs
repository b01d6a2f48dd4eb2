//! AES-256 in CTR mode (client obfuscation) and CBC mode (middle-end RPC)

use std::fmt;

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use cbc::cipher::generic_array::GenericArray;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProxyError, Result};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const BLOCK: usize = 16;

/// AES-256-CTR keystream. Encryption and decryption are the same
/// operation; the counter advances across calls.
pub struct AesCtr {
    cipher: Aes256Ctr,
}

impl AesCtr {
    pub fn new(key: &[u8; 32], iv: u128) -> Self {
        let iv_bytes = iv.to_be_bytes();
        Self {
            cipher: Aes256Ctr::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(&iv_bytes),
            ),
        }
    }

    /// XOR the keystream into `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }

    #[cfg(test)]
    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }

    #[cfg(test)]
    pub fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        self.encrypt(data)
    }
}

impl fmt::Debug for AesCtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesCtr { .. }")
    }
}

/// AES-256-CBC with the chaining IV carried between calls, so one value
/// encrypts (or decrypts) a whole stream of block-aligned chunks.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AesCbc {
    key: [u8; 32],
    iv: [u8; 16],
}

impl AesCbc {
    pub fn new(key: [u8; 32], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    pub fn encrypt_in_place(&mut self, data: &mut [u8]) -> Result<()> {
        check_aligned(data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let mut enc = Aes256CbcEnc::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&self.iv),
        );
        for block in data.chunks_exact_mut(BLOCK) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.iv.copy_from_slice(&data[data.len() - BLOCK..]);
        Ok(())
    }

    pub fn decrypt_in_place(&mut self, data: &mut [u8]) -> Result<()> {
        check_aligned(data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let mut next_iv = [0u8; BLOCK];
        next_iv.copy_from_slice(&data[data.len() - BLOCK..]);
        let mut dec = Aes256CbcDec::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&self.iv),
        );
        for block in data.chunks_exact_mut(BLOCK) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.iv = next_iv;
        Ok(())
    }
}

impl fmt::Debug for AesCbc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesCbc { .. }")
    }
}

fn check_aligned(len: usize) -> Result<()> {
    if len % BLOCK != 0 {
        return Err(ProxyError::Crypto(format!(
            "CBC data length {len} is not a multiple of {BLOCK}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST SP 800-38A, F.5.5 / F.2.5
    const KEY: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";
    const PLAIN: &str = "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51";

    fn key() -> [u8; 32] {
        hex::decode(KEY).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_ctr_nist_vector() {
        let iv = u128::from_be_bytes(
            hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").unwrap().try_into().unwrap(),
        );
        let mut ctr = AesCtr::new(&key(), iv);
        let out = ctr.encrypt(&hex::decode(PLAIN).unwrap());
        assert_eq!(
            hex::encode(out),
            "601ec313775789a5b7a7f504bbf3d228f443e3ca4d62b59aca84e990cacaf5c5"
        );
    }

    #[test]
    fn test_ctr_keystream_continues_across_calls() {
        let plain = hex::decode(PLAIN).unwrap();
        let mut whole = AesCtr::new(&key(), 7);
        let expected = whole.encrypt(&plain);

        let mut split = AesCtr::new(&key(), 7);
        let mut out = split.encrypt(&plain[..5]);
        out.extend(split.encrypt(&plain[5..]));
        assert_eq!(out, expected);
    }

    #[test]
    fn test_cbc_nist_vector() {
        let iv: [u8; 16] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let mut data = hex::decode(PLAIN).unwrap();
        AesCbc::new(key(), iv).encrypt_in_place(&mut data).unwrap();
        assert_eq!(
            hex::encode(&data),
            "f58c4c04d6e5f1ba779eabfb5f7bfbd69cfc4e967edb808d679f777bc6702c7d"
        );
    }

    #[test]
    fn test_cbc_chaining_across_chunks() {
        let iv = [3u8; 16];
        let plain: Vec<u8> = (0..64u8).collect();

        let mut one_shot = plain.clone();
        AesCbc::new(key(), iv).encrypt_in_place(&mut one_shot).unwrap();

        let mut enc = AesCbc::new(key(), iv);
        let mut chunked = plain.clone();
        let (a, b) = chunked.split_at_mut(32);
        enc.encrypt_in_place(a).unwrap();
        enc.encrypt_in_place(b).unwrap();
        assert_eq!(chunked, one_shot);

        let mut dec = AesCbc::new(key(), iv);
        let (a, b) = chunked.split_at_mut(16);
        dec.decrypt_in_place(a).unwrap();
        dec.decrypt_in_place(b).unwrap();
        assert_eq!(chunked, plain);
    }

    #[test]
    fn test_cbc_rejects_unaligned() {
        let mut data = vec![0u8; 15];
        assert!(AesCbc::new(key(), [0; 16]).encrypt_in_place(&mut data).is_err());
    }
}
