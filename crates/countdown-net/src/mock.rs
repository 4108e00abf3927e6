//! In-process network double.
//!
//! Routes are keyed by absolute URL. Unrouted URLs answer 404 like a real
//! server would; taking the network offline makes every call fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use url::Url;

use crate::{Fetch, NetError, Request, Response};

/// Canned behaviour for one URL.
#[derive(Debug, Clone)]
pub enum MockRoute {
    /// Answer with a response.
    Respond {
        status: StatusCode,
        content_type: String,
        body: Bytes,
    },
    /// Fail as if the connection dropped.
    Fail(String),
}

/// A request observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRequest {
    pub method: Method,
    pub url: Url,
}

/// Mock network for tests.
#[derive(Debug, Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, MockRoute>>,
    offline: AtomicBool,
    captured: Mutex<Vec<CapturedRequest>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MockNetwork::respond`].
    pub fn with_response(self, url: &str, status: u16, body: impl Into<Bytes>) -> Self {
        self.respond(url, status, body);
        self
    }

    /// Route `url` to a `text/plain` response.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        self.route(
            url,
            MockRoute::Respond {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                content_type: "text/plain".to_string(),
                body: body.into(),
            },
        );
    }

    /// Route `url` to a connection failure.
    pub fn fail(&self, url: &str, reason: &str) {
        self.route(url, MockRoute::Fail(reason.to_string()));
    }

    /// Install an arbitrary route.
    pub fn route(&self, url: &str, route: MockRoute) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), route);
    }

    /// Take the whole network down or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every request seen so far, in order.
    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Total number of fetches.
    pub fn call_count(&self) -> usize {
        self.captured.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of fetches of one URL.
    pub fn calls_to(&self, url: &str) -> usize {
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.url.as_str() == url)
            .count()
    }
}

#[async_trait]
impl Fetch for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(CapturedRequest {
                method: request.method.clone(),
                url: request.url.clone(),
            });

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }

        let route = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(request.url.as_str())
            .cloned();

        match route {
            Some(MockRoute::Respond {
                status,
                content_type,
                body,
            }) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&content_type) {
                    headers.insert(header::CONTENT_TYPE, value);
                }
                Ok(Response::new(request.url.clone(), status, headers, body))
            }
            Some(MockRoute::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            None => Ok(Response::new(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::new(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_routes_and_counts() {
        let network = MockNetwork::new().with_response("https://app.test/", 200, "<html>");
        let url = Url::parse("https://app.test/").unwrap();

        let response = network.fetch(&Request::get(url.clone())).await.unwrap();
        assert_eq!(response.text().unwrap(), "<html>");

        let missing = network
            .fetch(&Request::get(Url::parse("https://app.test/nope").unwrap()))
            .await
            .unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        assert_eq!(network.call_count(), 2);
        assert_eq!(network.calls_to("https://app.test/"), 1);
    }

    #[tokio::test]
    async fn test_mock_offline() {
        let network = MockNetwork::new().with_response("https://app.test/", 200, "<html>");
        network.set_offline(true);

        let result = network
            .fetch(&Request::get(Url::parse("https://app.test/").unwrap()))
            .await;
        assert!(matches!(result, Err(NetError::Offline(_))));
    }
}
