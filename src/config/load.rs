//! Config file schema, loading and validation

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::LogLevel;
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;

// ============= Sections =============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub use_middle_proxy: bool,

    #[serde(default)]
    pub prefer_ipv6: bool,

    /// 32 hex characters, middle-proxy mode only
    #[serde(default)]
    pub ad_tag: Option<String>,

    /// Concurrent session cap; 0 = unbounded
    #[serde(default)]
    pub max_connections: usize,

    #[serde(default = "default_stats_interval")]
    pub stats_log_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            use_middle_proxy: false,
            prefer_ipv6: false,
            ad_tag: None,
            max_connections: 0,
            stats_log_interval_secs: default_stats_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_listen_addr")]
    pub listen_addr_ipv4: String,

    #[serde(default)]
    pub listen_addr_ipv6: Option<String>,

    /// Host shown in `tg://proxy` links
    #[serde(default)]
    pub public_host: Option<String>,

    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            listen_addr_ipv4: default_listen_addr(),
            listen_addr_ipv6: None,
            public_host: None,
            backlog: default_backlog(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessConfig {
    /// 32 hex characters, or `dd` + 32 hex for secure-only
    pub secret: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            secret: "00000000000000000000000000000000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_handshake_timeout")]
    pub client_handshake: u64,
    #[serde(default = "default_connect_timeout")]
    pub tg_connect: u64,
    #[serde(default = "default_relay_idle")]
    pub relay_idle: u64,
    #[serde(default = "default_me_response")]
    pub me_response: u64,
    #[serde(default = "default_keepalive")]
    pub client_keepalive: u64,
    #[serde(default = "default_ack_timeout")]
    pub client_ack: u64,
}

impl TimeoutsConfig {
    pub fn client_handshake(&self) -> Duration {
        Duration::from_secs(self.client_handshake)
    }
    pub fn tg_connect(&self) -> Duration {
        Duration::from_secs(self.tg_connect)
    }
    pub fn relay_idle(&self) -> Duration {
        Duration::from_secs(self.relay_idle)
    }
    pub fn me_response(&self) -> Duration {
        Duration::from_secs(self.me_response)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            client_handshake: default_handshake_timeout(),
            tg_connect: default_connect_timeout(),
            relay_idle: default_relay_idle(),
            me_response: default_me_response(),
            client_keepalive: default_keepalive(),
            client_ack: default_ack_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayBackend {
    None,
    Bloom,
    #[default]
    Cache,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiReplayConfig {
    #[serde(default)]
    pub backend: ReplayBackend,
    #[serde(default = "default_bloom_size")]
    pub bloom_size_bytes: usize,
    #[serde(default = "default_bloom_error_rate")]
    pub bloom_error_rate: f64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_shards")]
    pub cache_shards: usize,
}

impl Default for AntiReplayConfig {
    fn default() -> Self {
        Self {
            backend: ReplayBackend::default(),
            bloom_size_bytes: default_bloom_size(),
            bloom_error_rate: default_bloom_error_rate(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl(),
            cache_shards: default_cache_shards(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Local address to bind outbound sockets to
    #[serde(default)]
    pub interface: Option<String>,

    /// DC used when a client asks for one we do not know
    #[serde(default = "default_dc")]
    pub default_dc: i16,

    /// `"dc" = "ip:port"`, wins over the built-in table
    #[serde(default)]
    pub dc_overrides: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            interface: None,
            default_dc: default_dc(),
            dc_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddleProxyConfig {
    #[serde(default = "default_proxy_secret_path")]
    pub proxy_secret_path: String,

    #[serde(default = "default_proxy_secret_url")]
    pub proxy_secret_url: String,

    /// Public IPv4 used in place of the local address in key derivation
    #[serde(default)]
    pub nat_ip: Option<IpAddr>,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// `"dc" = "ip:port"`, wins over the built-in middle-end table
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

impl Default for MiddleProxyConfig {
    fn default() -> Self {
        Self {
            proxy_secret_path: default_proxy_secret_path(),
            proxy_secret_url: default_proxy_secret_url(),
            nat_ip: None,
            cleanup_interval_secs: default_cleanup_interval(),
            overrides: HashMap::new(),
        }
    }
}

fn default_stats_interval() -> u64 { 60 }
fn default_port() -> u16 { 443 }
fn default_listen_addr() -> String { "0.0.0.0".to_string() }
fn default_backlog() -> u32 { 1024 }
fn default_handshake_timeout() -> u64 { DEFAULT_HANDSHAKE_TIMEOUT_SECS }
fn default_connect_timeout() -> u64 { DEFAULT_CONNECT_TIMEOUT_SECS }
fn default_relay_idle() -> u64 { DEFAULT_RELAY_IDLE_SECS }
fn default_me_response() -> u64 { DEFAULT_ME_RESPONSE_SECS }
fn default_keepalive() -> u64 { DEFAULT_KEEPALIVE_SECS }
fn default_ack_timeout() -> u64 { DEFAULT_ACK_TIMEOUT_SECS }
fn default_bloom_size() -> usize { 1 << 20 }
fn default_bloom_error_rate() -> f64 { 0.001 }
fn default_cache_capacity() -> usize { 65536 }
fn default_cache_ttl() -> u64 { 1800 }
fn default_cache_shards() -> usize { 16 }
fn default_dc() -> i16 { 2 }
fn default_proxy_secret_path() -> String { "proxy-secret".to_string() }
fn default_proxy_secret_url() -> String { "https://core.telegram.org/getProxySecret".to_string() }
fn default_cleanup_interval() -> u64 { 60 }

// ============= Top level =============

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub antireplay: AntiReplayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub middle_proxy: MiddleProxyConfig,
}

impl ProxyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: ProxyConfig =
            toml::from_str(content).map_err(|e| ProxyError::Config(e.to_string()))?;

        config.access.secret = config.access.secret.trim().to_ascii_lowercase();
        if let Some(tag) = config.general.ad_tag.take() {
            let tag = tag.trim().to_ascii_lowercase();
            if !tag.is_empty() {
                config.general.ad_tag = Some(tag);
            }
        }
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ProxyError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.secret()?;
        self.ad_tag()?;

        let ar = &self.antireplay;
        if ar.backend == ReplayBackend::Bloom {
            if ar.bloom_size_bytes == 0 {
                return Err(ProxyError::Config("antireplay.bloom_size_bytes must be > 0".into()));
            }
            if !(ar.bloom_error_rate > 0.0 && ar.bloom_error_rate < 1.0) {
                return Err(ProxyError::Config(
                    "antireplay.bloom_error_rate must be in (0, 1)".into(),
                ));
            }
        }
        if ar.backend == ReplayBackend::Cache {
            if ar.cache_capacity == 0 || ar.cache_shards == 0 {
                return Err(ProxyError::Config(
                    "antireplay.cache_capacity and cache_shards must be > 0".into(),
                ));
            }
            if ar.cache_ttl_secs == 0 {
                return Err(ProxyError::Config("antireplay.cache_ttl_secs must be > 0".into()));
            }
        }

        if self.general.stats_log_interval_secs == 0 || self.middle_proxy.cleanup_interval_secs == 0 {
            return Err(ProxyError::Config(
                "general.stats_log_interval_secs and middle_proxy.cleanup_interval_secs must be > 0".into(),
            ));
        }

        if self.upstream.default_dc == 0 {
            return Err(ProxyError::Config("upstream.default_dc must be non-zero".into()));
        }
        parse_dc_map(&self.upstream.dc_overrides, "upstream.dc_overrides")?;
        parse_dc_map(&self.middle_proxy.overrides, "middle_proxy.overrides")?;

        if let Some(iface) = &self.upstream.interface {
            iface.parse::<IpAddr>().map_err(|_| {
                ProxyError::Config(format!("upstream.interface '{iface}' is not an IP address"))
            })?;
        }
        Ok(())
    }

    pub fn secret(&self) -> Result<Secret> {
        Secret::parse(&self.access.secret)
    }

    /// Decoded ad-tag, if configured.
    pub fn ad_tag(&self) -> Result<Option<[u8; AD_TAG_LEN]>> {
        let Some(tag) = &self.general.ad_tag else {
            return Ok(None);
        };
        let bytes = hex::decode(tag)
            .map_err(|_| ProxyError::Config("general.ad_tag must be hex".into()))?;
        let tag: [u8; AD_TAG_LEN] = bytes.try_into().map_err(|_| {
            ProxyError::Config(format!("general.ad_tag must be {} hex characters", AD_TAG_LEN * 2))
        })?;
        Ok(Some(tag))
    }

    pub fn dc_overrides(&self) -> Result<HashMap<i16, SocketAddr>> {
        parse_dc_map(&self.upstream.dc_overrides, "upstream.dc_overrides")
    }

    pub fn me_overrides(&self) -> Result<HashMap<i16, SocketAddr>> {
        parse_dc_map(&self.middle_proxy.overrides, "middle_proxy.overrides")
    }
}

fn parse_dc_map(map: &HashMap<String, String>, what: &str) -> Result<HashMap<i16, SocketAddr>> {
    map.iter()
        .map(|(dc, addr)| {
            let dc: i16 = dc
                .trim()
                .parse()
                .map_err(|_| ProxyError::Config(format!("{what}: bad DC index '{dc}'")))?;
            let addr: SocketAddr = addr
                .trim()
                .parse()
                .map_err(|_| ProxyError::Config(format!("{what}: bad address '{addr}'")))?;
            Ok((dc, addr))
        })
        .collect()
}

// ============= Secret =============

/// The user secret clients authenticate with.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub bytes: [u8; SECRET_LEN],
    /// `dd`-prefixed secret: only secure framing is accepted
    pub secure_only: bool,
}

impl Secret {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (hex_part, secure_only) = match s.len() {
            32 => (s, false),
            34 if s.as_bytes()[..2].eq_ignore_ascii_case(b"dd") => (&s[2..], true),
            _ => {
                return Err(ProxyError::InvalidSecret {
                    reason: "must be 32 hex characters, optionally prefixed with 'dd'".into(),
                });
            }
        };
        let raw = hex::decode(hex_part).map_err(|_| ProxyError::InvalidSecret {
            reason: "not valid hex".into(),
        })?;
        let mut bytes = [0u8; SECRET_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self { bytes, secure_only })
    }

    /// Secret as advertised in links (`dd` prefix kept).
    pub fn to_link_hex(&self) -> String {
        if self.secure_only {
            format!("dd{}", hex::encode(self.bytes))
        } else {
            hex::encode(self.bytes)
        }
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("secure_only", &self.secure_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let cfg = ProxyConfig::parse("").unwrap();
        assert_eq!(cfg.server.port, 443);
        assert_eq!(cfg.antireplay.backend, ReplayBackend::Cache);
        assert_eq!(cfg.antireplay.cache_capacity, 65536);
        assert_eq!(cfg.antireplay.cache_ttl_secs, 1800);
        assert_eq!(cfg.antireplay.cache_shards, 16);
        assert_eq!(cfg.timeouts.relay_idle, 120);
        assert_eq!(cfg.general.max_connections, 0);
        assert_eq!(cfg.upstream.default_dc, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_full_file() {
        let cfg = ProxyConfig::parse(
            r#"
            [general]
            log_level = "verbose"
            use_middle_proxy = true
            ad_tag = "0123456789ABCDEF0123456789abcdef"
            max_connections = 5000

            [server]
            port = 8443
            public_host = "proxy.example.com"

            [access]
            secret = "dd00112233445566778899aabbccddeeff"

            [antireplay]
            backend = "bloom"
            bloom_size_bytes = 4096

            [upstream]
            dc_overrides = { "2" = "127.0.0.1:9000" }

            [middle_proxy]
            nat_ip = "203.0.113.9"
            overrides = { "-2" = "127.0.0.1:9001" }
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.general.log_level, LogLevel::Verbose);
        assert_eq!(cfg.server.port, 8443);
        assert_eq!(cfg.antireplay.backend, ReplayBackend::Bloom);
        assert_eq!(cfg.ad_tag().unwrap().unwrap()[0], 0x01);

        let secret = cfg.secret().unwrap();
        assert!(secret.secure_only);
        assert_eq!(secret.bytes[15], 0xff);
        assert_eq!(secret.to_link_hex(), "dd00112233445566778899aabbccddeeff");

        assert_eq!(cfg.dc_overrides().unwrap()[&2], "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.me_overrides().unwrap()[&-2], "127.0.0.1:9001".parse().unwrap());
    }

    #[test]
    fn test_secret_validation() {
        assert!(!Secret::parse("00112233445566778899aabbccddeeff").unwrap().secure_only);
        assert!(Secret::parse("00112233").is_err());
        assert!(Secret::parse("zz112233445566778899aabbccddeeff").is_err());
        assert!(Secret::parse("ee00112233445566778899aabbccddeeff").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = ProxyConfig::default();
        cfg.general.ad_tag = Some("abcd".into());
        assert!(cfg.validate().is_err());

        let mut cfg = ProxyConfig::default();
        cfg.antireplay.backend = ReplayBackend::Bloom;
        cfg.antireplay.bloom_error_rate = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = ProxyConfig::default();
        cfg.upstream.dc_overrides.insert("two".into(), "127.0.0.1:1".into());
        assert!(cfg.validate().is_err());

        let mut cfg = ProxyConfig::default();
        cfg.upstream.interface = Some("eth0".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_config_serializes() {
        let text = ProxyConfig::default().to_toml().unwrap();
        let back = ProxyConfig::parse(&text).unwrap();
        assert_eq!(back, ProxyConfig::default());
    }
}
