//! Asks a backend which models it serves via `GET {api_base}/models`.
use crate::client::HttpClient;
use crate::errors::DiscoveryError;
use axum::body::Body;
use axum::http::{HeaderValue, Method, Request, header};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use url::Url;

const MAX_LISTING_BYTES: usize = 4 * 1024 * 1024;

/// The only part of an OpenAI model listing discovery relies on.
#[derive(Debug, Deserialize)]
struct ModelListing {
    data: Vec<ListedModel>,
}

#[derive(Debug, Deserialize)]
struct ListedModel {
    id: String,
}

#[derive(Debug, Clone)]
pub struct ModelProber<C: HttpClient> {
    client: C,
    timeout: Duration,
}

impl<C: HttpClient + Send + Sync> ModelProber<C> {
    pub fn new(client: C, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Fetch and parse the model listing at `url`, failing closed on anything unexpected.
    pub async fn probe(
        &self,
        url: &Url,
        credential: &str,
    ) -> Result<BTreeSet<String>, DiscoveryError> {
        tokio::time::timeout(self.timeout, self.fetch(url, credential))
            .await
            .map_err(|_| DiscoveryError::ProbeTimeout {
                url: url.to_string(),
            })?
    }

    async fn fetch(&self, url: &Url, credential: &str) -> Result<BTreeSet<String>, DiscoveryError> {
        let probe_error = |reason: String| DiscoveryError::Probe {
            url: url.to_string(),
            reason,
        };

        let mut request = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .map_err(|e| probe_error(e.to_string()))?;
        if !credential.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {credential}"))
                .map_err(|e| probe_error(e.to_string()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| probe_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(probe_error(format!("status {}", response.status())));
        }

        let body = axum::body::to_bytes(response.into_body(), MAX_LISTING_BYTES)
            .await
            .map_err(|e| probe_error(e.to_string()))?;
        parse_listing(&body)
    }
}

fn parse_listing(body: &[u8]) -> Result<BTreeSet<String>, DiscoveryError> {
    let listing: ModelListing =
        serde_json::from_slice(body).map_err(|e| DiscoveryError::Decode(e.to_string()))?;
    let models: BTreeSet<String> = listing
        .data
        .into_iter()
        .map(|model| model.id)
        .filter(|id| !id.is_empty())
        .collect();
    if models.is_empty() {
        return Err(DiscoveryError::Decode("model listing is empty".into()));
    }
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHttpClient, MockUpstream};
    use axum::http::StatusCode;

    fn url() -> Url {
        "http://10.0.0.9:8000/v1/models".parse().unwrap()
    }

    #[tokio::test]
    async fn test_probe_parses_model_ids() {
        let client = MockHttpClient::new(
            StatusCode::OK,
            r#"{"object":"list","data":[{"id":"model1","object":"model"},{"id":"model2"}]}"#,
        );
        let prober = ModelProber::new(client.clone(), Duration::from_secs(1));

        let models = prober.probe(&url(), "sk-pod").await.unwrap();
        assert_eq!(
            models,
            BTreeSet::from(["model1".to_string(), "model2".to_string()])
        );

        let sent = &client.get_requests()[0];
        assert_eq!(sent.method, "GET");
        assert_eq!(sent.uri, "http://10.0.0.9:8000/v1/models");
        assert_eq!(sent.header("authorization"), Some("Bearer sk-pod"));
    }

    #[tokio::test]
    async fn test_probe_without_credential_sends_no_auth() {
        let client = MockHttpClient::new(StatusCode::OK, r#"{"data":[{"id":"m"}]}"#);
        let prober = ModelProber::new(client.clone(), Duration::from_secs(1));
        prober.probe(&url(), "").await.unwrap();
        assert_eq!(client.get_requests()[0].header("authorization"), None);
    }

    #[tokio::test]
    async fn test_probe_fails_closed_on_bad_shapes() {
        for body in [
            r#"{"models":["m"]}"#,
            r#"{"data":[]}"#,
            r#"{"data":[{"name":"m"}]}"#,
            "not json",
        ] {
            let prober = ModelProber::new(
                MockHttpClient::new(StatusCode::OK, body),
                Duration::from_secs(1),
            );
            assert!(
                matches!(prober.probe(&url(), "").await, Err(DiscoveryError::Decode(_))),
                "{body}"
            );
        }
    }

    #[tokio::test]
    async fn test_probe_error_status_and_transport() {
        let prober = ModelProber::new(
            MockHttpClient::new(StatusCode::SERVICE_UNAVAILABLE, "starting"),
            Duration::from_secs(1),
        );
        assert!(matches!(
            prober.probe(&url(), "").await,
            Err(DiscoveryError::Probe { .. })
        ));

        let client = MockHttpClient::new(StatusCode::OK, "{}")
            .with_upstream("10.0.0.9", MockUpstream::fail("connection refused"));
        let prober = ModelProber::new(client, Duration::from_secs(1));
        let err = prober.probe(&url(), "").await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let answer = MockUpstream::delayed(
            Duration::from_secs(5),
            StatusCode::OK,
            r#"{"data":[{"id":"m"}]}"#,
        );
        let client = MockHttpClient::new(StatusCode::OK, "{}").with_upstream("10.0.0.9", answer);
        let prober = ModelProber::new(client, Duration::from_millis(50));
        assert!(matches!(
            prober.probe(&url(), "").await,
            Err(DiscoveryError::ProbeTimeout { .. })
        ));
    }
}
