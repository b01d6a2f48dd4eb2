//! Hot-reload: watches the config file and reloads it on SIGHUP (Unix)
//! or on a periodic timer (all platforms).
//!
//! # What can be reloaded without restart
//!
//! | Section   | Field       | Effect                              |
//! |-----------|-------------|-------------------------------------|
//! | `general` | `log_level` | Filter updated via the level channel |
//! | `general` | `ad_tag`    | Used from the next connection on    |
//! | `timeouts`| all         | Used from the next connection on    |
//!
//! Listener addresses, the secret, the relay mode, the anti-replay backend
//! and the middle-proxy settings are **not** applied; a warning is emitted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::LogLevel;
use super::load::{ProxyConfig, TimeoutsConfig};

/// Fields that are safe to swap without restarting listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct HotFields {
    pub log_level: LogLevel,
    pub ad_tag: Option<String>,
    pub timeouts: TimeoutsConfig,
}

impl HotFields {
    pub fn from_config(cfg: &ProxyConfig) -> Self {
        Self {
            log_level: cfg.general.log_level,
            ad_tag: cfg.general.ad_tag.clone(),
            timeouts: cfg.timeouts.clone(),
        }
    }
}

/// Names of changed fields that only take effect after a restart.
pub fn restart_required_changes(old: &ProxyConfig, new: &ProxyConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if old.server != new.server {
        changed.push("server");
    }
    if old.access != new.access {
        changed.push("access.secret");
    }
    if old.general.use_middle_proxy != new.general.use_middle_proxy {
        changed.push("general.use_middle_proxy");
    }
    if old.general.prefer_ipv6 != new.general.prefer_ipv6 {
        changed.push("general.prefer_ipv6");
    }
    if old.general.max_connections != new.general.max_connections {
        changed.push("general.max_connections");
    }
    if old.antireplay != new.antireplay {
        changed.push("antireplay");
    }
    if old.upstream != new.upstream {
        changed.push("upstream");
    }
    if old.middle_proxy != new.middle_proxy {
        changed.push("middle_proxy");
    }
    changed
}

/// Spawn the hot-reload watcher task.
///
/// Returns:
/// - `watch::Receiver<Arc<ProxyConfig>>`: the accept loop takes one snapshot
///   per accepted connection.
/// - `watch::Receiver<LogLevel>`: the caller applies changes to the
///   `tracing` reload handle.
pub fn spawn_config_watcher(
    config_path: PathBuf,
    initial: Arc<ProxyConfig>,
    reload_interval: Duration,
) -> (watch::Receiver<Arc<ProxyConfig>>, watch::Receiver<LogLevel>) {
    let initial_level = initial.general.log_level;
    let (config_tx, config_rx) = watch::channel(initial);
    let (log_tx, log_rx) = watch::channel(initial_level);

    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sighup = {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::hangup()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "SIGHUP handler unavailable, timer reload only");
                    None
                }
            }
        };

        let mut interval = tokio::time::interval(reload_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = interval.tick() => {},
                Some(()) = async {
                    match sighup.as_mut() {
                        Some(s) => s.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    info!("SIGHUP received, reloading config from {:?}", config_path);
                }
            }
            #[cfg(not(unix))]
            interval.tick().await;

            if config_tx.is_closed() {
                break;
            }

            let new_cfg = match ProxyConfig::load(&config_path) {
                Ok(c) => c,
                Err(e) => {
                    error!("config reload: failed to parse {:?}: {}", config_path, e);
                    continue;
                }
            };

            if let Err(e) = new_cfg.validate() {
                error!("config reload: validation failed: {}; keeping old config", e);
                continue;
            }

            let old_cfg = config_tx.borrow().clone();
            if *old_cfg == new_cfg {
                continue;
            }

            for field in restart_required_changes(&old_cfg, &new_cfg) {
                warn!("config reload: {} changed; restart required", field);
            }

            let old_hot = HotFields::from_config(&old_cfg);
            let new_hot = HotFields::from_config(&new_cfg);

            if old_hot.log_level != new_hot.log_level {
                info!(
                    "config reload: log_level: '{}' -> '{}'",
                    old_hot.log_level, new_hot.log_level
                );
                log_tx.send(new_hot.log_level).ok();
            }

            if old_hot.ad_tag != new_hot.ad_tag {
                info!(
                    "config reload: ad_tag: {} -> {}",
                    old_hot.ad_tag.as_deref().unwrap_or("none"),
                    new_hot.ad_tag.as_deref().unwrap_or("none"),
                );
            }

            if old_hot.timeouts != new_hot.timeouts {
                info!(
                    handshake = new_hot.timeouts.client_handshake,
                    connect = new_hot.timeouts.tg_connect,
                    relay_idle = new_hot.timeouts.relay_idle,
                    me_response = new_hot.timeouts.me_response,
                    "config reload: timeouts updated"
                );
            }

            config_tx.send(Arc::new(new_cfg)).ok();
        }
    });

    (config_rx, log_rx)
}
