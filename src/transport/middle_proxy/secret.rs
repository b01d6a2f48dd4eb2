//! Telegram proxy-secret fetching
//!
//! This is NOT the client secret. It is the infrastructure secret shared by
//! all proxies (`--aes-pwd` of the reference proxy), a binary blob of at
//! least 32 bytes used only for middle-end key derivation.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};

/// A cached copy younger than this is used without downloading.
const CACHE_MAX_AGE: Duration = Duration::from_secs(86400);

const MIN_SECRET_LEN: usize = 32;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Load the proxy-secret from `cache_path` if fresh, otherwise download it
/// from `url` and cache it back to disk.
pub async fn fetch_proxy_secret(cache_path: &Path, url: &str) -> Result<Vec<u8>> {
    if let Some(data) = read_fresh_cache(cache_path).await {
        return Ok(data);
    }

    info!(url, "Downloading proxy-secret");
    let data = download_proxy_secret(url).await?;

    if let Err(e) = tokio::fs::write(cache_path, &data).await {
        warn!(path = %cache_path.display(), error = %e, "Failed to cache proxy-secret (non-fatal)");
    } else {
        debug!(path = %cache_path.display(), len = data.len(), "Cached proxy-secret");
    }

    Ok(data)
}

async fn read_fresh_cache(path: &Path) -> Option<Vec<u8>> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let age = SystemTime::now()
        .duration_since(metadata.modified().ok()?)
        .unwrap_or(Duration::ZERO);
    if age >= CACHE_MAX_AGE {
        debug!(path = %path.display(), age_hours = age.as_secs() / 3600, "Cached proxy-secret is stale");
        return None;
    }

    let data = tokio::fs::read(path).await.ok()?;
    if data.len() < MIN_SECRET_LEN {
        warn!(path = %path.display(), len = data.len(), "Cached proxy-secret too short");
        return None;
    }
    info!(
        path = %path.display(),
        len = data.len(),
        age_hours = age.as_secs() / 3600,
        "Loaded proxy-secret from cache"
    );
    Some(data)
}

async fn download_proxy_secret(url: &str) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| ProxyError::Config(format!("HTTP client: {e}")))?;

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamUnavailable(format!("proxy-secret download: {e}")))?;

    if !resp.status().is_success() {
        return Err(ProxyError::UpstreamUnavailable(format!(
            "proxy-secret download HTTP {}",
            resp.status()
        )));
    }

    let data = resp
        .bytes()
        .await
        .map_err(|e| ProxyError::UpstreamUnavailable(format!("proxy-secret body: {e}")))?
        .to_vec();

    if data.len() < MIN_SECRET_LEN {
        return Err(ProxyError::UpstreamUnavailable(format!(
            "proxy-secret too short: {} bytes (need >= {MIN_SECRET_LEN})",
            data.len()
        )));
    }

    info!(len = data.len(), "Downloaded proxy-secret");
    Ok(data)
}
