//! Background sync.
//!
//! Pages register tags; the platform fires them once connectivity returns.
//! Firing consumes the registration. Nothing is retried.

use countdown_net::{Fetch, Request};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheHandle, RequestKey};

/// Tags waiting to fire.
#[derive(Debug, Default)]
pub struct SyncManager {
    tags: Vec<String>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tag. Registering a pending tag again is a no-op.
    pub fn register(&mut self, tag: &str) {
        if !self.tags.iter().any(|t| t == tag) {
            debug!(tag, "Sync registered");
            self.tags.push(tag.to_string());
        }
    }

    /// Pending tags in registration order.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Remove a pending tag before it fires. Returns whether it was pending.
    pub fn take(&mut self, tag: &str) -> bool {
        match self.tags.iter().position(|t| t == tag) {
            Some(index) => {
                self.tags.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Result of a fired sync tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The endpoint answered 2xx and the bucket now holds it.
    Refreshed { url: String },
    /// The endpoint answered with a non-2xx status; nothing was stored.
    Unsuccessful { status: u16 },
    /// The fetch or the cache write failed.
    Failed(String),
    /// The tag isn't one this worker handles.
    UnknownTag(String),
}

/// Fetch `url` and store it in `bucket` on success.
pub async fn refresh(network: &dyn Fetch, bucket: &CacheHandle, url: &Url) -> SyncOutcome {
    let request = Request::get(url.clone());
    let response = match network.fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, error = %e, "Background sync fetch failed");
            return SyncOutcome::Failed(e.to_string());
        }
    };

    if !response.ok() {
        warn!(url = %url, status = %response.status, "Background sync got unsuccessful status");
        return SyncOutcome::Unsuccessful {
            status: response.status.as_u16(),
        };
    }

    match bucket.put(RequestKey::for_request(&request), &response).await {
        Ok(()) => {
            info!(url = %url, bucket = bucket.name(), "Background sync refreshed");
            SyncOutcome::Refreshed {
                url: url.to_string(),
            }
        }
        Err(e) => {
            warn!(url = %url, error = %e, "Background sync could not store response");
            SyncOutcome::Failed(e.to_string())
        }
    }
}
