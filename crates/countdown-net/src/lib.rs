//! # Countdown Net
//!
//! Request/response model and the network layer seen by the offline worker.
//!
//! ## Design Goals
//!
//! 1. **Shared bodies**: a [`Response`] body is an immutable [`Bytes`] buffer,
//!    so handing a clone to the cache never consumes the caller's copy.
//! 2. **Swappable network**: the worker only talks to the [`Fetch`] trait.
//!    [`ResourceLoader`] is the reqwest-backed implementation; the `mock`
//!    feature provides an in-process double.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use http;
pub use url;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin subresource.
    #[default]
    SameOrigin,
    /// CORS subresource.
    Cors,
    /// Opaque cross-origin subresource.
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub referrer: Option<Url>,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            referrer: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a GET navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body);
        request
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set referrer.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Whether this is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response with a fully buffered, shareable body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Whether the response was served from cache storage.
    pub from_cache: bool,
    body: Bytes,
}

impl Response {
    /// Create a network response.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers,
            from_cache: false,
            body: body.into(),
        }
    }

    /// Create a 200 response with a content type.
    pub fn with_content_type(url: Url, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        Self::new(url, StatusCode::OK, headers, body)
    }

    /// Mark the response as served from cache.
    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Get the body as bytes. Cheap: the buffer is reference counted.
    pub fn bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }
}

/// A network capable of executing requests.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Execute the request. Errors mean no response was obtained at all;
    /// HTTP error statuses are returned as `Ok`.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Transport timeout of the host network.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("countdown-sw/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// reqwest-backed network.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Fetch for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header(header::ACCEPT_LANGUAGE, &self.config.accept_language);

        if let Some(ref referrer) = request.referrer {
            req_builder = req_builder.header(header::REFERER, referrer.as_str());
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_connect() {
                NetError::Offline(e.to_string())
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::new(url, status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone()).header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("application/json"),
        );

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_navigate_request() {
        let request = Request::navigate(Url::parse("https://example.com/about").unwrap());
        assert!(request.is_navigation());
        assert_eq!(request.method, Method::GET);
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_response_clone_shares_body() {
        let url = Url::parse("https://example.com/a.js").unwrap();
        let response = Response::with_content_type(url, "text/javascript", "let a = 1;");
        let copy = response.clone();

        assert_eq!(response.body(), copy.body());
        assert_eq!(response.text().unwrap(), "let a = 1;");
        assert_eq!(copy.content_type().unwrap().subtype(), "javascript");
        assert!(!copy.from_cache);
        assert!(copy.cached().from_cache);
    }

    #[test]
    fn test_response_ok_range() {
        let url = Url::parse("https://example.com/").unwrap();
        let ok = Response::new(url.clone(), StatusCode::NO_CONTENT, HeaderMap::new(), "");
        let missing = Response::new(url, StatusCode::NOT_FOUND, HeaderMap::new(), "");
        assert!(ok.ok());
        assert!(!missing.ok());
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("countdown_net=trace")
            .with_test_writer()
            .try_init();
    }

    #[tokio::test]
    async fn test_loader_fetches_body_and_status() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/quote"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string(r#"{"id":"q1"}"#),
            )
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/api/quote", server.uri())).unwrap();
        let response = loader.fetch(&Request::get(url)).await.unwrap();

        assert!(response.ok());
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], "q1");
    }

    #[tokio::test]
    async fn test_loader_returns_error_status_as_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/broken", server.uri())).unwrap();
        let response = loader.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_loader_unreachable_host_is_error() {
        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse("http://127.0.0.1:9/unreachable").unwrap();
        assert!(loader.fetch(&Request::get(url)).await.is_err());
    }
}
