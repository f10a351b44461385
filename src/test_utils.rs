//! Mocks for exercising the proxy without real backends or a real cluster.
use crate::client::{BoxError, HttpClient};
use crate::discovery::{PodInfo, PodLister};
use crate::errors::DiscoveryError;
use async_trait::async_trait;
use axum::http::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a mocked backend answers.
#[derive(Debug, Clone)]
pub enum MockUpstream {
    Respond {
        status: StatusCode,
        body: String,
        delay: Option<Duration>,
    },
    Stream {
        status: StatusCode,
        chunks: Vec<String>,
    },
    Fail(String),
}

impl MockUpstream {
    pub fn respond(status: StatusCode, body: &str) -> Self {
        MockUpstream::Respond {
            status,
            body: body.to_string(),
            delay: None,
        }
    }

    pub fn delayed(delay: Duration, status: StatusCode, body: &str) -> Self {
        MockUpstream::Respond {
            status,
            body: body.to_string(),
            delay: Some(delay),
        }
    }

    pub fn streaming(status: StatusCode, chunks: Vec<String>) -> Self {
        MockUpstream::Stream { status, chunks }
    }

    pub fn fail(reason: &str) -> Self {
        MockUpstream::Fail(reason.to_string())
    }

    async fn respond_to(&self) -> Result<axum::response::Response, BoxError> {
        use axum::body::Body;
        use futures_util::stream;

        match self {
            MockUpstream::Respond {
                status,
                body,
                delay,
            } => {
                if let Some(delay) = delay {
                    tokio::time::sleep(*delay).await;
                }
                Ok(axum::response::Response::builder()
                    .status(*status)
                    .header("content-type", "application/json")
                    .body(Body::from(body.clone()))?)
            }
            MockUpstream::Stream { status, chunks } => {
                let stream = stream::iter(
                    chunks
                        .clone()
                        .into_iter()
                        .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
                );
                Ok(axum::response::Response::builder()
                    .status(*status)
                    .header("content-type", "text/event-stream")
                    .header("cache-control", "no-cache")
                    .header("connection", "keep-alive")
                    .body(Body::from_stream(stream))?)
            }
            MockUpstream::Fail(reason) => Err(reason.clone().into()),
        }
    }
}

/// An [`HttpClient`] that records every request and answers per target host.
#[derive(Clone, Debug)]
pub struct MockHttpClient {
    pub requests: Arc<Mutex<Vec<MockRequest>>>,
    default: MockUpstream,
    upstreams: Arc<Mutex<HashMap<String, MockUpstream>>>,
}

#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl MockHttpClient {
    /// Every host answers with `status` and `body`.
    pub fn new(status: StatusCode, body: &str) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            default: MockUpstream::respond(status, body),
            upstreams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            default: MockUpstream::streaming(status, chunks),
            upstreams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Requests to `host` get `upstream` instead of the default answer.
    pub fn with_upstream(self, host: &str, upstream: MockUpstream) -> Self {
        self.set_upstream(host, upstream);
        self
    }

    /// Change how `host` answers; visible through every clone.
    pub fn set_upstream(&self, host: &str, upstream: MockUpstream) {
        self.upstreams
            .lock()
            .unwrap()
            .insert(host.to_string(), upstream);
    }

    pub fn get_requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, host: &str) -> Vec<MockRequest> {
        self.get_requests()
            .into_iter()
            .filter(|request| {
                request
                    .uri
                    .parse::<axum::http::Uri>()
                    .ok()
                    .and_then(|uri| uri.host().map(|h| h == host))
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, BoxError> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let host = req.uri().host().unwrap_or_default().to_string();
        let headers = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .map_err(|e| Box::new(e) as BoxError)?
            .to_vec();

        self.requests.lock().unwrap().push(MockRequest {
            method,
            uri,
            headers,
            body,
        });

        let upstream = self
            .upstreams
            .lock()
            .unwrap()
            .get(&host)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        upstream.respond_to().await
    }
}

/// A [`PodLister`] whose answers are set by the test, per (namespace, selector).
#[derive(Clone, Debug, Default)]
pub struct MockPodLister {
    answers: Arc<Mutex<HashMap<(String, String), Result<Vec<PodInfo>, String>>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockPodLister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pods(&self, namespace: &str, selector: &str, pods: Vec<PodInfo>) {
        self.answers
            .lock()
            .unwrap()
            .insert((namespace.to_string(), selector.to_string()), Ok(pods));
    }

    pub fn set_error(&self, namespace: &str, selector: &str, error: &str) {
        self.answers.lock().unwrap().insert(
            (namespace.to_string(), selector.to_string()),
            Err(error.to_string()),
        );
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodLister for MockPodLister {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInfo>, DiscoveryError> {
        let key = (namespace.to_string(), label_selector.to_string());
        self.calls.lock().unwrap().push(key.clone());
        match self.answers.lock().unwrap().get(&key) {
            Some(Ok(pods)) => Ok(pods.clone()),
            Some(Err(e)) => Err(DiscoveryError::Api(e.clone())),
            None => Ok(Vec::new()),
        }
    }
}
