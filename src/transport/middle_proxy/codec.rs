//! RPC frame codec: `len | seq | payload | crc32`, plaintext or CBC

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::crypto::{crc32, AesCbc};
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;

/// Length word of a padding filler; readers skip it.
const FILLER_LEN: usize = 4;

/// Build an RPC frame: `[len(4) | seq_no(4) | payload | crc32(4)]`
pub fn build_rpc_frame(seq_no: i32, payload: &[u8]) -> Vec<u8> {
    let total_len = (4 + 4 + payload.len() + 4) as u32;
    let mut f = Vec::with_capacity(total_len as usize + CBC_PADDING);
    f.extend_from_slice(&total_len.to_le_bytes());
    f.extend_from_slice(&seq_no.to_le_bytes());
    f.extend_from_slice(payload);
    let c = crc32(&f);
    f.extend_from_slice(&c.to_le_bytes());
    f
}

/// Pad to the CBC block size with repeating `04 00 00 00` filler words.
pub fn pad_to_block(buf: &mut Vec<u8>) {
    let pad = (CBC_PADDING - buf.len() % CBC_PADDING) % CBC_PADDING;
    buf.extend((0..pad).map(|i| PADDING_FILLER[i % 4]));
}

fn check_frame_len(len: usize) -> Result<()> {
    if !(MIN_MSG_LEN..=MAX_MSG_LEN).contains(&len) {
        return Err(ProxyError::InvalidMessageLength {
            len,
            min: MIN_MSG_LEN,
            max: MAX_MSG_LEN,
        });
    }
    Ok(())
}

/// Verify CRC and sequence of a whole frame and return its payload.
fn open_frame(frame: Bytes, expected_seq: Option<i32>) -> Result<(i32, Bytes)> {
    let len = frame.len();
    let crc_at = len - 4;
    let expected_crc = u32::from_le_bytes([
        frame[crc_at],
        frame[crc_at + 1],
        frame[crc_at + 2],
        frame[crc_at + 3],
    ]);
    let actual_crc = crc32(&frame[..crc_at]);
    if expected_crc != actual_crc {
        return Err(ProxyError::Protocol(format!(
            "RPC CRC mismatch: 0x{expected_crc:08x} vs 0x{actual_crc:08x}"
        )));
    }

    let seq_no = i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    if let Some(expected) = expected_seq {
        if seq_no != expected {
            return Err(ProxyError::Protocol(format!(
                "RPC sequence {seq_no}, expected {expected}"
            )));
        }
    }
    Ok((seq_no, frame.slice(8..crc_at)))
}

/// Read one plaintext RPC frame. Returns `(seq_no, payload)`.
pub async fn read_rpc_frame_plaintext<R>(rd: &mut R) -> Result<(i32, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    rd.read_exact(&mut len_buf).await?;
    let total_len = u32::from_le_bytes(len_buf) as usize;
    check_frame_len(total_len)?;

    let mut full = BytesMut::with_capacity(total_len);
    full.extend_from_slice(&len_buf);
    full.resize(total_len, 0);
    rd.read_exact(&mut full[4..]).await?;

    open_frame(full.freeze(), None)
}

pub async fn write_rpc_frame_plaintext<W>(wr: &mut W, seq_no: i32, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    wr.write_all(&build_rpc_frame(seq_no, payload)).await?;
    wr.flush().await?;
    Ok(())
}

// ========== Encrypted stream ==========

/// Writes CBC-encrypted RPC frames with an increasing sequence number.
pub struct RpcWriter<W> {
    writer: W,
    cipher: AesCbc,
    seq_no: i32,
}

impl<W: AsyncWrite + Unpin> RpcWriter<W> {
    /// `seq_no` is the number of the first frame written.
    pub fn new(writer: W, key: [u8; 32], iv: [u8; 16], seq_no: i32) -> Self {
        Self {
            writer,
            cipher: AesCbc::new(key, iv),
            seq_no,
        }
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut buf = build_rpc_frame(self.seq_no, payload);
        self.seq_no = self.seq_no.wrapping_add(1);
        pad_to_block(&mut buf);
        self.cipher.encrypt_in_place(&mut buf)?;
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Reads CBC-encrypted RPC frames, skipping padding and checking CRC and
/// sequence numbers.
pub struct RpcReader<R> {
    reader: R,
    cipher: AesCbc,
    expected_seq: i32,
    /// Ciphertext not yet forming a whole block
    raw: BytesMut,
    /// Decrypted bytes not yet forming a whole frame
    plain: BytesMut,
}

impl<R: AsyncRead + Unpin> RpcReader<R> {
    /// `seq_no` is the number expected on the first frame.
    pub fn new(reader: R, key: [u8; 32], iv: [u8; 16], seq_no: i32) -> Self {
        Self {
            reader,
            cipher: AesCbc::new(key, iv),
            expected_seq: seq_no,
            raw: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            plain: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Read the next frame payload. EOF between frames is `StreamClosed`.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(payload) = self.try_take_frame()? {
                return Ok(payload);
            }

            let n = self.reader.read_buf(&mut self.raw).await?;
            if n == 0 {
                return Err(ProxyError::StreamClosed("middle-end closed the connection".into()));
            }

            let whole = self.raw.len() / CBC_PADDING * CBC_PADDING;
            if whole > 0 {
                let mut chunk = self.raw.split_to(whole);
                self.cipher.decrypt_in_place(&mut chunk)?;
                self.plain.extend_from_slice(&chunk);
            }
        }
    }

    fn try_take_frame(&mut self) -> Result<Option<Bytes>> {
        while self.plain.len() >= 4 {
            let len = u32::from_le_bytes([self.plain[0], self.plain[1], self.plain[2], self.plain[3]])
                as usize;
            if len == FILLER_LEN {
                self.plain.advance(FILLER_LEN);
                continue;
            }
            check_frame_len(len)?;
            if self.plain.len() < len {
                return Ok(None);
            }

            let frame = self.plain.split_to(len).freeze();
            let (seq, payload) = open_frame(frame, Some(self.expected_seq))?;
            trace!(seq, len = payload.len(), "RPC frame");
            self.expected_seq = self.expected_seq.wrapping_add(1);
            return Ok(Some(payload));
        }
        Ok(None)
    }
}
