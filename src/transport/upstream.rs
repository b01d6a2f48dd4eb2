//! Datacenter resolution and outbound dialing for direct mode

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::protocol::constants::{TG_DATACENTERS_V4, TG_DATACENTERS_V6, TG_DATACENTER_PORT};
use crate::transport::socket::connect_bound;

/// Map a wire DC index to a slot in the datacenter tables.
///
/// `±1..±5` map directly. Anything else (CDN and test DCs) goes to
/// `default_dc`, like the `default` directive of the official proxy config.
pub fn dc_slot(dc_idx: i16, default_dc: i16, num_dcs: usize) -> usize {
    let abs = dc_idx.unsigned_abs() as usize;
    if (1..=num_dcs).contains(&abs) {
        return abs - 1;
    }
    let fallback = default_dc.unsigned_abs() as usize;
    if (1..=num_dcs).contains(&fallback) {
        fallback - 1
    } else {
        1
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamManager {
    bind_ip: Option<IpAddr>,
    prefer_ipv6: bool,
    default_dc: i16,
    overrides: HashMap<i16, SocketAddr>,
}

impl UpstreamManager {
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let bind_ip = match config.upstream.interface.as_deref() {
            Some(s) => Some(s.parse::<IpAddr>().map_err(|_| {
                ProxyError::Config(format!("upstream.interface '{s}' is not an IP address"))
            })?),
            None => None,
        };
        Ok(Self {
            bind_ip,
            prefer_ipv6: config.general.prefer_ipv6,
            default_dc: config.upstream.default_dc,
            overrides: config.dc_overrides()?,
        })
    }

    /// Candidate addresses for a DC in dial order.
    pub fn resolve(&self, dc_idx: i16) -> Vec<SocketAddr> {
        if let Some(addr) = self.overrides.get(&dc_idx) {
            debug!(dc = dc_idx, %addr, "Using DC override");
            return vec![*addr];
        }

        let slot = dc_slot(dc_idx, self.default_dc, TG_DATACENTERS_V4.len());
        if slot + 1 != dc_idx.unsigned_abs() as usize {
            if let Some(addr) = self.overrides.get(&self.default_dc) {
                return vec![*addr];
            }
            info!(original_dc = dc_idx, fallback_dc = slot + 1, "Unknown DC, using default");
        }

        let v4 = SocketAddr::new(TG_DATACENTERS_V4[slot], TG_DATACENTER_PORT);
        let mut out = Vec::with_capacity(2);
        if self.prefer_ipv6 {
            if let Some(ip) = TG_DATACENTERS_V6.get(slot) {
                out.push(SocketAddr::new(*ip, TG_DATACENTER_PORT));
            }
        }
        out.push(v4);

        // A bind address pins the family.
        if let Some(bind) = self.bind_ip {
            out.retain(|a| a.is_ipv4() == bind.is_ipv4());
        }
        out
    }

    /// Dial the DC, trying each candidate once. No retry beyond that.
    pub async fn connect(&self, dc_idx: i16, connect_timeout: Duration) -> Result<TcpStream> {
        let candidates = self.resolve(dc_idx);
        let mut last_err = ProxyError::UpstreamUnavailable(format!("no address for DC {dc_idx}"));

        for addr in candidates {
            match timeout(connect_timeout, connect_bound(addr, self.bind_ip)).await {
                Ok(Ok(stream)) => {
                    debug!(dc = dc_idx, %addr, "Connected to DC");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    warn!(dc = dc_idx, %addr, error = %e, "DC connect failed");
                    last_err = ProxyError::UpstreamUnavailable(format!("{addr}: {e}"));
                }
                Err(_) => {
                    warn!(dc = dc_idx, %addr, "DC connect timed out");
                    last_err = ProxyError::ConnectionTimeout { addr: addr.to_string() };
                }
            }
        }

        Err(last_err)
    }
}
