//! Application context shared by every session

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use crate::config::{ProxyConfig, Secret};
use crate::crypto::SecureRandom;
use crate::error::Result;
use crate::stats::{ReplayChecker, Stats};
use crate::stream::BufferPool;
use crate::transport::middle_proxy::MePool;
use crate::transport::UpstreamManager;

/// Everything a session needs, built once at startup and handed to the
/// accept loop. Tests build isolated instances the same way.
pub struct ProxyContext {
    /// Latest validated config; each session takes one snapshot.
    pub config: watch::Receiver<Arc<ProxyConfig>>,
    pub secret: Secret,
    pub stats: Arc<Stats>,
    pub replay: Arc<ReplayChecker>,
    pub buffer_pool: Arc<BufferPool>,
    pub rng: Arc<SecureRandom>,
    pub upstream: Arc<UpstreamManager>,
    /// Present only in middle-proxy mode
    pub me_pool: Option<Arc<MePool>>,
    /// Admission gate; `None` when `max_connections` is 0
    pub admission: Option<Arc<Semaphore>>,
}

impl ProxyContext {
    /// Build a context from a config receiver. The middle-end pool is
    /// attached separately because it needs the downloaded proxy-secret.
    pub fn new(
        config: watch::Receiver<Arc<ProxyConfig>>,
        stats: Arc<Stats>,
        rng: Arc<SecureRandom>,
    ) -> Result<Self> {
        let cfg = config.borrow().clone();
        let secret = cfg.secret()?;
        let admission = match cfg.general.max_connections {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Ok(Self {
            secret,
            stats,
            replay: Arc::new(ReplayChecker::from_config(&cfg.antireplay)),
            buffer_pool: Arc::new(BufferPool::new()),
            rng,
            upstream: Arc::new(UpstreamManager::from_config(&cfg)?),
            me_pool: None,
            admission,
            config,
        })
    }

    pub fn with_me_pool(mut self, pool: Arc<MePool>) -> Self {
        self.me_pool = Some(pool);
        self
    }

    /// Config snapshot for one session.
    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        self.config.borrow().clone()
    }
}
