//! TCP socket setup

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Options for a listening socket.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub reuse_address: bool,
    pub ipv6_only: bool,
    pub backlog: u32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            ipv6_only: false,
            backlog: 1024,
        }
    }
}

/// Bind a listening socket with the given options.
fn create_listener(addr: SocketAddr, options: &ListenOptions) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if options.reuse_address {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(options.ipv6_only)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(options.backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket)
}

/// Bind and wrap in a tokio listener. Must be called inside a runtime.
pub fn bind_listener(addr: SocketAddr, options: &ListenOptions) -> io::Result<TcpListener> {
    let socket = create_listener(addr, options)?;
    TcpListener::from_std(socket.into())
}

/// Client socket tuning: no Nagle, TCP keepalive, and on Linux a bound
/// on unacknowledged data so dead peers are noticed.
pub fn configure_client_socket(
    stream: &TcpStream,
    keepalive_secs: u64,
    ack_timeout_secs: u64,
) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    if keepalive_secs > 0 {
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(keepalive_secs))
            .with_interval(Duration::from_secs(keepalive_secs));
        sock.set_tcp_keepalive(&keepalive)?;
    }

    #[cfg(target_os = "linux")]
    {
        if ack_timeout_secs > 0 {
            sock.set_tcp_user_timeout(Some(Duration::from_secs(ack_timeout_secs)))?;
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = ack_timeout_secs;

    Ok(())
}

/// Outbound connect, optionally bound to a local address.
pub async fn connect_bound(target: SocketAddr, bind_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let socket = match bind_ip {
        Some(ip) => {
            if ip.is_ipv4() != target.is_ipv4() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bind address {ip} does not match family of {target}"),
                ));
            }
            let socket = if target.is_ipv4() {
                tokio::net::TcpSocket::new_v4()?
            } else {
                tokio::net::TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            debug!(%target, bind = %ip, "Outbound socket bound");
            socket
        }
        None => {
            if target.is_ipv4() {
                tokio::net::TcpSocket::new_v4()?
            } else {
                tokio::net::TcpSocket::new_v6()?
            }
        }
    };

    let stream = socket.connect(target).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
