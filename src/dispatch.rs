//! Fan-out of one inbound request over the endpoints serving its model
//!
//! Each candidate gets its own bounded attempt. A timeout, transport error or 5xx moves on
//! to the next candidate; any other response is the backend's answer and goes straight back
//! to the caller. Under [`FanoutPolicy::Race`] all candidates are tried at once and the first
//! success wins; the losing attempts are dropped, which cancels their in-flight calls. If
//! nothing succeeds the caller gets a single [`ProxyError::UpstreamExhausted`].
use crate::auth::CredentialRewriter;
use crate::client::HttpClient;
use crate::endpoint::EndpointRecord;
use crate::errors::ProxyError;
use crate::settings::{DispatchSettings, FanoutPolicy};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: [header::HeaderName; 10] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// An inbound call, buffered so it can be replayed against several backends.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub model: String,
    pub method: Method,
    /// Path below the API base, e.g. `/chat/completions`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Why one candidate did not produce the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Timeout(Duration),
    Transport(String),
    Status(StatusCode),
    BadRequest(String),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            AttemptError::Transport(e) => write!(f, "transport error: {e}"),
            AttemptError::Status(status) => write!(f, "backend returned {status}"),
            AttemptError::BadRequest(e) => write!(f, "could not build request: {e}"),
        }
    }
}

#[derive(Debug)]
pub struct Dispatcher<T: HttpClient> {
    client: T,
    rewriter: Arc<CredentialRewriter>,
    policy: FanoutPolicy,
    attempt_timeout: Duration,
}

impl<T: HttpClient + Send + Sync> Dispatcher<T> {
    pub fn new(client: T, rewriter: Arc<CredentialRewriter>, settings: &DispatchSettings) -> Self {
        Self {
            client,
            rewriter,
            policy: settings.policy,
            attempt_timeout: settings.attempt_timeout(),
        }
    }

    /// Try `candidates` under the configured policy and return the first success.
    pub async fn dispatch(
        &self,
        request: &ProxiedRequest,
        candidates: Vec<Arc<EndpointRecord>>,
    ) -> Result<Response, ProxyError> {
        if candidates.is_empty() {
            return Err(ProxyError::ModelNotFound(request.model.clone()));
        }
        let attempts = candidates.len();

        let last = match self.policy {
            FanoutPolicy::Sequential => {
                let mut last = None;
                for record in &candidates {
                    match self.attempt(request, record).await {
                        Ok(response) => return Ok(response),
                        Err(e) => last = Some(e),
                    }
                }
                last
            }
            FanoutPolicy::Race => {
                let mut inflight: FuturesUnordered<_> = candidates
                    .iter()
                    .map(|record| self.attempt(request, record))
                    .collect();
                let mut last = None;
                while let Some(result) = inflight.next().await {
                    match result {
                        // returning drops `inflight`, cancelling the slower attempts
                        Ok(response) => return Ok(response),
                        Err(e) => last = Some(e),
                    }
                }
                last
            }
        };

        let last = last
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no backend available".to_string());
        warn!(model = %request.model, attempts, %last, "All backends failed");
        Err(ProxyError::UpstreamExhausted {
            model: request.model.clone(),
            attempts,
            last,
        })
    }

    async fn attempt(
        &self,
        request: &ProxiedRequest,
        record: &EndpointRecord,
    ) -> Result<Response, AttemptError> {
        let outbound = self.build_request(request, record)?;
        debug!(
            model = %request.model,
            endpoint = %record.id,
            uri = %outbound.uri(),
            "Forwarding request"
        );

        let result =
            tokio::time::timeout(self.attempt_timeout, self.client.request(outbound)).await;
        let outcome = match result {
            Err(_) => Err(AttemptError::Timeout(self.attempt_timeout)),
            Ok(Err(e)) => Err(AttemptError::Transport(e.to_string())),
            Ok(Ok(response)) if response.status().is_server_error() => {
                Err(AttemptError::Status(response.status()))
            }
            Ok(Ok(response)) => Ok(strip_hop_by_hop(response)),
        };

        if let Err(e) = &outcome {
            warn!(
                model = %request.model,
                endpoint = %record.id,
                error = %e,
                "Backend attempt failed"
            );
        }
        outcome
    }

    fn build_request(
        &self,
        request: &ProxiedRequest,
        record: &EndpointRecord,
    ) -> Result<Request<Body>, AttemptError> {
        let url = record.upstream_url(&request.path, request.query.as_deref());

        let mut headers = request.headers.clone();
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }
        if let Some(host) = url.host_str() {
            let authority = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            let value = HeaderValue::from_str(&authority)
                .map_err(|e| AttemptError::BadRequest(e.to_string()))?;
            headers.insert(header::HOST, value);
        }
        self.rewriter
            .apply_outbound(&mut headers, record)
            .map_err(|e| AttemptError::BadRequest(format!("invalid backend credential: {e}")))?;

        let mut outbound = Request::builder()
            .method(request.method.clone())
            .uri(url.as_str())
            .body(Body::from(request.body.clone()))
            .map_err(|e| AttemptError::BadRequest(e.to_string()))?;
        *outbound.headers_mut() = headers;
        Ok(outbound)
    }
}

fn strip_hop_by_hop(mut response: Response) -> Response {
    let headers = response.headers_mut();
    for name in [
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::HeaderName::from_static("keep-alive"),
    ] {
        headers.remove(name);
    }
    response
}
