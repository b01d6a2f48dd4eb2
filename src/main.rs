//! mtrelay - MTProto obfuscated2 proxy

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

mod config;
mod crypto;
mod error;
mod protocol;
mod proxy;
mod stats;
mod stream;
mod transport;

use crate::config::hot_reload::spawn_config_watcher;
use crate::config::{LogLevel, ProxyConfig};
use crate::crypto::SecureRandom;
use crate::proxy::{run_listener, ProxyContext};
use crate::stats::{run_stats_logger, Stats};
use crate::transport::middle_proxy::{fetch_proxy_secret, MePool};
use crate::transport::{bind_listener, ListenOptions};

const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

struct CliArgs {
    config_path: String,
    silent: bool,
    log_level: Option<String>,
}

fn parse_cli() -> CliArgs {
    let mut cli = CliArgs {
        config_path: "config.toml".to_string(),
        silent: false,
        log_level: None,
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--silent" | "-s" => cli.silent = true,
            "--log-level" => {
                i += 1;
                if i < args.len() {
                    cli.log_level = Some(args[i].clone());
                }
            }
            s if s.starts_with("--log-level=") => {
                cli.log_level = Some(s.trim_start_matches("--log-level=").to_string());
            }
            "--version" | "-V" => {
                println!("mtrelay {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                eprintln!("Usage: mtrelay [config.toml] [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --silent, -s            Only warnings and errors");
                eprintln!("  --log-level <LEVEL>     debug|verbose|normal|silent");
                eprintln!("  --version, -V           Print version");
                eprintln!("  --help, -h              Show this help");
                std::process::exit(0);
            }
            s if !s.starts_with('-') => cli.config_path = s.to_string(),
            other => eprintln!("Unknown option: {other}"),
        }
        i += 1;
    }
    cli
}

/// Load the config, writing a default one when the file does not exist.
fn load_or_create(path: &Path) -> anyhow::Result<ProxyConfig> {
    if !path.exists() {
        let default = ProxyConfig::default();
        std::fs::write(path, default.to_toml()?)
            .with_context(|| format!("writing default config to {}", path.display()))?;
        eprintln!("[mtrelay] Created default config at {}", path.display());
        return Ok(default);
    }
    ProxyConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

fn runtime_filter(level: LogLevel, has_rust_log: bool) -> EnvFilter {
    if has_rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level.to_filter_str())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_cli();
    let config_path = PathBuf::from(&cli.config_path);

    let config = load_or_create(&config_path)?;
    config.validate().context("invalid config")?;

    let has_rust_log = std::env::var("RUST_LOG").is_ok();
    let cli_level = match cli.log_level.as_deref().map(str::parse::<LogLevel>) {
        Some(Ok(level)) => Some(level),
        Some(Err(e)) => bail!(e),
        None => None,
    };
    let effective_level = if cli.silent {
        LogLevel::Silent
    } else {
        cli_level.unwrap_or(config.general.log_level)
    };
    // A level given on the command line pins the filter; config reloads
    // only apply when it was left to the file.
    let level_pinned = cli.silent || cli_level.is_some();

    // Startup lines always show; the configured level applies afterwards.
    let (filter_layer, filter_handle) = reload::Layer::new(EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::Layer::default())
        .init();

    info!("mtrelay v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", effective_level);
    info!(
        "Mode: {}",
        if config.general.use_middle_proxy { "middle proxy" } else { "direct" }
    );

    let stats = Arc::new(Stats::new());
    let rng = Arc::new(SecureRandom::new());
    let shutdown = CancellationToken::new();

    let (config_rx, mut log_rx) =
        spawn_config_watcher(config_path.clone(), Arc::new(config.clone()), CONFIG_RELOAD_INTERVAL);

    let mut ctx = ProxyContext::new(config_rx, stats.clone(), rng.clone())?;
    if ctx.secret.secure_only {
        info!("Secure-only secret: non-padded clients are rejected");
    }

    if config.general.use_middle_proxy {
        let mp = &config.middle_proxy;
        let proxy_secret = fetch_proxy_secret(Path::new(&mp.proxy_secret_path), &mp.proxy_secret_url)
            .await
            .context("proxy-secret unavailable")?;
        info!(len = proxy_secret.len(), "proxy-secret loaded");

        let pool = MePool::from_config(&config, proxy_secret, stats.clone(), rng.clone())?;
        tokio::spawn(
            pool.clone()
                .run_cleanup(Duration::from_secs(mp.cleanup_interval_secs), shutdown.clone()),
        );
        ctx = ctx.with_me_pool(pool);
    }
    let ctx = Arc::new(ctx);

    tokio::spawn(run_stats_logger(
        stats.clone(),
        Duration::from_secs(config.general.stats_log_interval_secs),
    ));

    let mut listeners = Vec::new();
    let mut addrs: Vec<(SocketAddr, bool)> = Vec::new();
    let v4: SocketAddr = format!("{}:{}", config.server.listen_addr_ipv4, config.server.port)
        .parse()
        .with_context(|| format!("bad listen_addr_ipv4 '{}'", config.server.listen_addr_ipv4))?;
    addrs.push((v4, false));
    if let Some(v6) = &config.server.listen_addr_ipv6 {
        let v6: SocketAddr = format!("[{}]:{}", v6, config.server.port)
            .parse()
            .with_context(|| format!("bad listen_addr_ipv6 '{v6}'"))?;
        addrs.push((v6, true));
    }

    for (addr, ipv6_only) in addrs {
        let options = ListenOptions {
            ipv6_only,
            backlog: config.server.backlog,
            ..Default::default()
        };
        match bind_listener(addr, &options) {
            Ok(listener) => listeners.push(listener),
            Err(e) => error!("Failed to bind to {}: {}", addr, e),
        }
    }
    if listeners.is_empty() {
        bail!("no listeners could be bound");
    }

    let link_host = config
        .server
        .public_host
        .clone()
        .unwrap_or_else(|| config.server.listen_addr_ipv4.clone());
    info!("--- Proxy Link ---");
    info!(
        "tg://proxy?server={}&port={}&secret={}",
        link_host,
        config.server.port,
        ctx.secret.to_link_hex()
    );
    if config.server.public_host.is_none() {
        warn!("server.public_host is not set; the link uses the listen address");
    }
    info!("------------------");

    if let Err(e) = filter_handle.reload(runtime_filter(effective_level, has_rust_log)) {
        warn!(error = %e, "Failed to switch log filter");
    }

    if !level_pinned && !has_rust_log {
        let filter_handle = filter_handle.clone();
        tokio::spawn(async move {
            while log_rx.changed().await.is_ok() {
                let level = *log_rx.borrow_and_update();
                match filter_handle.reload(EnvFilter::new(level.to_filter_str())) {
                    Ok(()) => info!("Log level changed to {}", level),
                    Err(e) => warn!(error = %e, "Failed to apply new log level"),
                }
            }
        });
    }

    for listener in listeners {
        tokio::spawn(run_listener(listener, ctx.clone(), shutdown.clone()));
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Signal error: {}", e),
    }
    shutdown.cancel();

    Ok(())
}
