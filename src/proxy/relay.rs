//! Bidirectional byte relay for direct mode

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ProxyError, Result};
use crate::stats::Stats;
use crate::stream::{BufferPool, PooledBuffer};

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn name(self) -> &'static str {
        match self {
            Direction::ClientToServer => "C->S",
            Direction::ServerToClient => "S->C",
        }
    }

    fn count(self, stats: &Stats, n: usize) {
        match self {
            Direction::ClientToServer => stats.add_octets_from_client(n as u64),
            Direction::ServerToClient => stats.add_octets_to_client(n as u64),
        }
    }
}

/// Copy bytes both ways until either side finishes.
///
/// Each direction runs in its own task with a pooled buffer. The first
/// direction to end cancels the other; both writers are shut down before
/// this returns. Every read and write must finish within `idle`.
pub async fn relay_bidirectional<CR, CW, SR, SW>(
    client_reader: CR,
    client_writer: CW,
    server_reader: SR,
    server_writer: SW,
    idle: Duration,
    stats: Arc<Stats>,
    buffer_pool: Arc<BufferPool>,
) -> Result<()>
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    SR: AsyncRead + Unpin + Send + 'static,
    SW: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();

    let c2s = tokio::spawn(copy_direction(
        client_reader,
        server_writer,
        buffer_pool.get(),
        idle,
        cancel.clone(),
        Direction::ClientToServer,
        stats.clone(),
    ));
    let s2c = tokio::spawn(copy_direction(
        server_reader,
        client_writer,
        buffer_pool.get(),
        idle,
        cancel.clone(),
        Direction::ServerToClient,
        stats,
    ));

    let (c2s, s2c) = tokio::join!(c2s, s2c);
    let c2s = unwrap_join(c2s);
    let s2c = unwrap_join(s2c);

    match (&c2s, &s2c) {
        (Ok(up), Ok(down)) => debug!(c2s_bytes = up, s2c_bytes = down, "Relay finished"),
        _ => debug!(c2s = ?c2s.as_ref().err(), s2c = ?s2c.as_ref().err(), "Relay finished with error"),
    }
    c2s?;
    s2c?;
    Ok(())
}

/// A panicking direction takes the session down with it so the
/// supervisor sees the panic.
fn unwrap_join(res: std::result::Result<Result<u64>, JoinError>) -> Result<u64> {
    match res {
        Ok(r) => r,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(ProxyError::StreamClosed("relay task cancelled".into())),
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    mut buf: PooledBuffer,
    idle: Duration,
    cancel: CancellationToken,
    dir: Direction,
    stats: Arc<Stats>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cap = buf.capacity();
    buf.resize(cap, 0);
    let mut total = 0u64;

    let res = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            r = timeout(idle, reader.read(&mut buf[..])) => match r {
                Err(_) => break Err(ProxyError::IdleTimeout(dir.name())),
                Ok(Err(e)) => break Err(ProxyError::Io(e)),
                Ok(Ok(0)) => {
                    trace!(dir = dir.name(), "EOF");
                    break Ok(());
                }
                Ok(Ok(n)) => n,
            },
        };

        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        match timeout(idle, write).await {
            Err(_) => break Err(ProxyError::IdleTimeout(dir.name())),
            Ok(Err(e)) => break Err(ProxyError::Io(e)),
            Ok(Ok(())) => {}
        }
        total += n as u64;
        dir.count(&stats, n);
    };

    cancel.cancel();
    let _ = writer.shutdown().await;
    res.map(|()| total)
}
