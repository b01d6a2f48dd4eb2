//! MTProto transport framing: abridged, intermediate, secure intermediate

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::SecureRandom;
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;

/// Largest abridged length, in 4-byte words.
const ABRIDGED_MAX_WORDS: usize = 1 << 24;

/// Transient per-packet ack state of one direction.
///
/// `quick_ack` is set by the reader when the peer asked for a quick ack;
/// `simple_ack` tells the writer the payload is an ack reply.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckFlags {
    pub quick_ack: bool,
    pub simple_ack: bool,
}

impl AckFlags {
    pub fn reset(&mut self) {
        *self = AckFlags::default();
    }
}

/// Reads whole packets in the framing chosen by the client's tag.
pub struct FramedReader<R> {
    inner: R,
    proto: ProtoTag,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R, proto: ProtoTag) -> Self {
        Self { inner, proto }
    }

    pub fn proto(&self) -> ProtoTag {
        self.proto
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read one packet. Flags found in the header are recorded in `flags`.
    pub async fn read_packet(&mut self, flags: &mut AckFlags) -> Result<Bytes> {
        match self.proto {
            ProtoTag::Abridged => self.read_abridged(flags).await,
            ProtoTag::Intermediate | ProtoTag::Secure => self.read_intermediate(flags).await,
        }
    }

    async fn read_abridged(&mut self, flags: &mut AckFlags) -> Result<Bytes> {
        let mut first = [0u8; 1];
        self.read_header(&mut first).await?;

        let mut words = first[0];
        if words >= ABRIDGED_QUICKACK_BIT {
            flags.quick_ack = true;
            words -= ABRIDGED_QUICKACK_BIT;
        }
        let words = if words == ABRIDGED_LONG_MARKER {
            let mut ext = [0u8; 3];
            self.inner.read_exact(&mut ext).await?;
            u32::from_le_bytes([ext[0], ext[1], ext[2], 0]) as usize
        } else {
            words as usize
        };
        let len = words * 4;
        if len > MAX_MSG_LEN {
            return Err(ProxyError::InvalidMessageLength {
                len,
                min: 0,
                max: MAX_MSG_LEN,
            });
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(Bytes::from(payload))
    }

    async fn read_intermediate(&mut self, flags: &mut AckFlags) -> Result<Bytes> {
        let mut hdr = [0u8; 4];
        self.read_header(&mut hdr).await?;

        let mut raw = u32::from_le_bytes(hdr);
        if raw & INTERMEDIATE_QUICKACK_BIT != 0 {
            flags.quick_ack = true;
            raw &= !INTERMEDIATE_QUICKACK_BIT;
        }
        let len = raw as usize;
        if len > MAX_MSG_LEN {
            return Err(ProxyError::InvalidMessageLength {
                len,
                min: 0,
                max: MAX_MSG_LEN,
            });
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        // Unaligned lengths lose their tail. For secure framing the tail is
        // padding; for intermediate it is kept as-is for wire compatibility.
        payload.truncate(len - len % 4);
        Ok(Bytes::from(payload))
    }

    /// Read a packet header; EOF before the first byte is a clean close.
    async fn read_header(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.inner.read(&mut buf[..1]).await?;
        if n == 0 {
            return Err(ProxyError::StreamClosed("peer closed".into()));
        }
        if buf.len() > 1 {
            self.inner.read_exact(&mut buf[1..]).await?;
        }
        Ok(())
    }
}

/// Writes whole packets in the client's framing.
pub struct FramedWriter<W> {
    inner: W,
    proto: ProtoTag,
    rng: Arc<SecureRandom>,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W, proto: ProtoTag, rng: Arc<SecureRandom>) -> Self {
        Self { inner, proto, rng }
    }

    pub async fn write_packet(&mut self, data: &[u8], flags: AckFlags) -> Result<()> {
        let frame = match self.proto {
            ProtoTag::Abridged => encode_abridged(data, flags)?,
            ProtoTag::Intermediate => encode_intermediate(data, flags, 0),
            ProtoTag::Secure => {
                let pad = if flags.simple_ack { 0 } else { self.rng.range(4) };
                let mut frame = encode_intermediate(data, flags, pad);
                if pad > 0 {
                    let start = frame.len() - pad;
                    self.rng.fill(&mut frame[start..]);
                }
                frame
            }
        };
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

fn encode_abridged(data: &[u8], flags: AckFlags) -> Result<Vec<u8>> {
    if flags.simple_ack {
        return Ok(data.iter().rev().copied().collect());
    }
    if data.len() % 4 != 0 {
        return Err(ProxyError::Protocol(format!(
            "abridged payload length {} is not a multiple of 4",
            data.len()
        )));
    }
    let words = data.len() / 4;
    if words >= ABRIDGED_MAX_WORDS {
        return Err(ProxyError::InvalidMessageLength {
            len: data.len(),
            min: 0,
            max: (ABRIDGED_MAX_WORDS - 1) * 4,
        });
    }

    let mut out = Vec::with_capacity(4 + data.len());
    if words < ABRIDGED_LONG_MARKER as usize {
        out.push(words as u8);
    } else {
        out.push(ABRIDGED_LONG_MARKER);
        out.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
    }
    out.extend_from_slice(data);
    Ok(out)
}

/// Length prefix plus payload plus `pad` trailing bytes (left zeroed).
fn encode_intermediate(data: &[u8], flags: AckFlags, pad: usize) -> Vec<u8> {
    if flags.simple_ack {
        return data.to_vec();
    }
    let mut len = (data.len() + pad) as u32;
    if flags.quick_ack {
        len |= INTERMEDIATE_QUICKACK_BIT;
    }
    let mut out = Vec::with_capacity(4 + data.len() + pad);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    out.resize(out.len() + pad, 0);
    out
}
