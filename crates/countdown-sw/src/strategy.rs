//! Request classification.
//!
//! Every intercepted request maps to exactly one [`Policy`]. Non-GET and
//! cross-origin requests are never touched.

use countdown_core::WorkerConfig;
use http::Method;
use url::{Origin, Url};

/// How the interceptor answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Let the request go to the network untouched.
    Passthrough,
    /// Prefer the network, fall back to cache on failure.
    NetworkFirst,
    /// Prefer the cache, fetch on a miss.
    CacheFirst,
}

/// Kind of same-origin GET request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Calls under the API marker.
    DynamicApi,
    /// Scripts, styles, images, fonts.
    StaticAsset,
    /// Anything else, typically a page.
    NavigationPage,
}

impl RequestClass {
    /// Policy applied to this class.
    pub fn policy(self) -> Policy {
        match self {
            RequestClass::DynamicApi | RequestClass::NavigationPage => Policy::NetworkFirst,
            RequestClass::StaticAsset => Policy::CacheFirst,
        }
    }
}

/// Pure classifier configured with the worker's origin and URL shapes.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    origin: Origin,
    api_marker: String,
    static_extensions: Vec<String>,
}

impl StrategySelector {
    pub fn new(origin: &Url, api_marker: &str, static_extensions: &[String]) -> Self {
        Self {
            origin: origin.origin(),
            api_marker: api_marker.to_string(),
            static_extensions: static_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(&config.origin, &config.api_marker, &config.static_extensions)
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin
    }

    /// Whether the last path segment carries a static-asset extension.
    pub fn is_static_asset(&self, url: &Url) -> bool {
        let last = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("")
            .to_ascii_lowercase();
        self.static_extensions.iter().any(|ext| last.ends_with(ext.as_str()))
    }

    /// Class of a same-origin GET.
    pub fn class(&self, url: &Url) -> RequestClass {
        if url.path().contains(&self.api_marker) {
            RequestClass::DynamicApi
        } else if self.is_static_asset(url) {
            RequestClass::StaticAsset
        } else {
            RequestClass::NavigationPage
        }
    }

    /// Pick the policy for a request.
    pub fn classify(&self, url: &Url, method: &Method) -> Policy {
        if *method != Method::GET || !self.is_same_origin(url) {
            return Policy::Passthrough;
        }
        self.class(url).policy()
    }
}
