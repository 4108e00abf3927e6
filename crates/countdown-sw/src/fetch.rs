//! Fetch interception: network-first and cache-first strategies.

use std::sync::Arc;

use countdown_core::WorkerConfig;
use countdown_net::{Fetch, Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::cache::{CacheHandle, CacheStorage, RequestKey};
use crate::event::Lifetime;
use crate::lifecycle::ServiceWorkerRegistration;
use crate::strategy::{Policy, StrategySelector};
use crate::Result;

/// Answers intercepted requests for one generation.
#[derive(Clone)]
pub struct FetchInterceptor {
    selector: StrategySelector,
    caches: CacheStorage,
    bucket: CacheHandle,
    generation: String,
    registration: Arc<RwLock<ServiceWorkerRegistration>>,
    network: Arc<dyn Fetch>,
    shell: RequestKey,
}

impl FetchInterceptor {
    pub fn new(
        config: &WorkerConfig,
        caches: CacheStorage,
        network: Arc<dyn Fetch>,
        registration: Arc<RwLock<ServiceWorkerRegistration>>,
    ) -> Result<Self> {
        Ok(Self {
            selector: StrategySelector::from_config(config),
            bucket: caches.handle(&config.bucket_name()),
            generation: config.generation.clone(),
            shell: RequestKey::get(&config.resolve("/")?),
            registration,
            caches,
            network,
        })
    }

    pub fn selector(&self) -> &StrategySelector {
        &self.selector
    }

    /// Handle a request. `None` means the request goes to the network untouched.
    ///
    /// Cache writes are registered on `lifetime` and may still be running when
    /// this returns.
    pub async fn handle(&self, request: &Request, lifetime: &Lifetime) -> Result<Option<Response>> {
        match self.selector.classify(&request.url, &request.method) {
            Policy::Passthrough => {
                trace!(url = %request.url, method = %request.method, "Passthrough");
                Ok(None)
            }
            Policy::NetworkFirst => self.network_first(request, lifetime).await.map(Some),
            Policy::CacheFirst => self.cache_first(request, lifetime).await.map(Some),
        }
    }

    /// Network, then the exact cache entry, then the offline shell for navigations.
    pub async fn network_first(&self, request: &Request, lifetime: &Lifetime) -> Result<Response> {
        let error = match self.network.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    self.write_through(request, &response, lifetime);
                }
                return Ok(response);
            }
            Err(e) => e,
        };

        debug!(url = %request.url, error = %error, "Network failed, trying cache");
        let key = RequestKey::for_request(request);
        if let Some(entry) = self.caches.match_request(&key).await {
            return entry.to_response();
        }

        if request.is_navigation() {
            if let Some(shell) = self.caches.match_request(&self.shell).await {
                debug!(url = %request.url, "Serving offline shell");
                return shell.to_response();
            }
        }

        warn!(url = %request.url, error = %error, "No cached fallback");
        Err(error.into())
    }

    /// Cache hit without touching the network; otherwise fetch and store.
    pub async fn cache_first(&self, request: &Request, lifetime: &Lifetime) -> Result<Response> {
        let key = RequestKey::for_request(request);
        if let Some(entry) = self.caches.match_request(&key).await {
            trace!(url = %request.url, "Cache hit");
            return entry.to_response();
        }

        let response = self.network.fetch(request).await?;
        if response.ok() {
            self.write_through(request, &response, lifetime);
        }
        Ok(response)
    }

    /// Store a copy of `response` in the current bucket as tracked background work.
    ///
    /// The write is dropped once this generation is neither waiting nor
    /// active, so a retired worker never brings its purged bucket back.
    fn write_through(&self, request: &Request, response: &Response, lifetime: &Lifetime) {
        let key = RequestKey::for_request(request);
        let bucket = self.bucket.clone();
        let generation = self.generation.clone();
        let registration = self.registration.clone();
        let snapshot = response.clone();
        lifetime.wait_until(async move {
            // held across the put: activation cannot start its purge mid-write
            let registration = registration.read().await;
            if !registration.is_current(&generation) {
                debug!(key = %key, generation = %generation, "Generation retired, skipping cache write");
                return;
            }
            if let Err(e) = bucket.put(key.clone(), &snapshot).await {
                warn!(key = %key, bucket = bucket.name(), error = %e, "Cache write failed");
            }
        });
    }
}
