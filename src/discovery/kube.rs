//! A minimal Kubernetes REST client: just enough to list pods by label selector.
//!
//! In-cluster it talks to `https://$KUBERNETES_SERVICE_HOST:$KUBERNETES_SERVICE_PORT`,
//! trusting the service account CA and sending the service account token. The token file is
//! re-read on every call since projected tokens rotate.
use super::pods::{PodInfo, PodLister};
use crate::client::{HttpClient, HyperClient};
use crate::errors::{ConfigError, DiscoveryError};
use crate::settings::DiscoverySettings;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderValue, Method, Request, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const API_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_POD_LIST_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: ObjectMeta,
    #[serde(default)]
    status: Option<PodStatus>,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
}

impl Pod {
    fn into_info(self, namespace: &str) -> PodInfo {
        let status = self.status.unwrap_or_default();
        PodInfo {
            name: self.metadata.name,
            namespace: self
                .metadata
                .namespace
                .unwrap_or_else(|| namespace.to_string()),
            ip: status.pod_ip.filter(|ip| !ip.is_empty()),
            phase: status.phase.unwrap_or_default(),
            annotations: self.metadata.annotations.unwrap_or_default(),
        }
    }
}

#[derive(Debug)]
pub struct KubeApiClient<C: HttpClient = HyperClient> {
    client: C,
    server: Url,
    token_file: Option<PathBuf>,
}

impl KubeApiClient<HyperClient> {
    /// Build a client from discovery settings: an explicit `api_server` if set, otherwise
    /// the in-cluster service account.
    pub async fn from_settings(settings: &DiscoverySettings) -> Result<Self, ConfigError> {
        match &settings.api_server {
            Some(server) => {
                let server = Url::parse(server).map_err(|e| {
                    ConfigError::Kubernetes(format!("invalid api_server '{server}': {e}"))
                })?;
                let tls = native_tls::TlsConnector::new()
                    .map_err(|e| ConfigError::Kubernetes(e.to_string()))?;
                Ok(Self::new(
                    build_client(tls),
                    server,
                    settings.token_file.clone(),
                ))
            }
            None => Self::in_cluster(settings.token_file.clone()).await,
        }
    }

    async fn in_cluster(token_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            ConfigError::Kubernetes(
                "KUBERNETES_SERVICE_HOST is not set and no api_server is configured".into(),
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        let server = Url::parse(&format!("https://{host}:{port}"))
            .map_err(|e| ConfigError::Kubernetes(e.to_string()))?;

        let ca_path = Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt");
        let ca = tokio::fs::read(&ca_path).await.map_err(|e| {
            ConfigError::Kubernetes(format!("failed to read {}: {e}", ca_path.display()))
        })?;
        let ca = native_tls::Certificate::from_pem(&ca)
            .map_err(|e| ConfigError::Kubernetes(format!("invalid cluster CA: {e}")))?;
        let tls = native_tls::TlsConnector::builder()
            .add_root_certificate(ca)
            .build()
            .map_err(|e| ConfigError::Kubernetes(e.to_string()))?;

        let token_file =
            token_file.unwrap_or_else(|| Path::new(SERVICE_ACCOUNT_DIR).join("token"));
        debug!(server = %server, "Using in-cluster Kubernetes API");
        Ok(Self::new(build_client(tls), server, Some(token_file)))
    }
}

fn build_client(tls: native_tls::TlsConnector) -> HyperClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    let https = hyper_tls::HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));
    Client::builder(TokioExecutor::new()).build(https)
}

impl<C: HttpClient + Send + Sync> KubeApiClient<C> {
    pub fn new(client: C, server: Url, token_file: Option<PathBuf>) -> Self {
        Self {
            client,
            server,
            token_file,
        }
    }

    fn pods_url(&self, namespace: &str, label_selector: &str) -> Result<Url, DiscoveryError> {
        let mut url = self.server.clone();
        url.path_segments_mut()
            .map_err(|_| {
                DiscoveryError::Api(format!("api server '{}' cannot be a base", self.server))
            })?
            .pop_if_empty()
            .extend(["api", "v1", "namespaces", namespace, "pods"]);
        url.query_pairs_mut()
            .append_pair("labelSelector", label_selector);
        Ok(url)
    }

    async fn bearer(&self) -> Result<Option<HeaderValue>, DiscoveryError> {
        let Some(path) = &self.token_file else {
            return Ok(None);
        };
        let token = tokio::fs::read_to_string(path).await.map_err(|e| {
            DiscoveryError::Api(format!("failed to read token {}: {e}", path.display()))
        })?;
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|e| DiscoveryError::Api(format!("invalid token: {e}")))?;
        value.set_sensitive(true);
        Ok(Some(value))
    }

    async fn fetch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInfo>, DiscoveryError> {
        let url = self.pods_url(namespace, label_selector)?;
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .map_err(|e| DiscoveryError::Api(e.to_string()))?;
        if let Some(bearer) = self.bearer().await? {
            request.headers_mut().insert(header::AUTHORIZATION, bearer);
        }

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| DiscoveryError::Api(e.to_string()))?;
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), MAX_POD_LIST_BYTES)
            .await
            .map_err(|e| DiscoveryError::Api(e.to_string()))?;
        if !status.is_success() {
            return Err(DiscoveryError::ApiStatus {
                status,
                body: String::from_utf8_lossy(&body).chars().take(512).collect(),
            });
        }

        let list: PodList =
            serde_json::from_slice(&body).map_err(|e| DiscoveryError::Decode(e.to_string()))?;
        Ok(list
            .items
            .into_iter()
            .map(|pod| pod.into_info(namespace))
            .collect())
    }
}

#[async_trait]
impl<C: HttpClient + Send + Sync> PodLister for KubeApiClient<C> {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInfo>, DiscoveryError> {
        tokio::time::timeout(API_TIMEOUT, self.fetch_pods(namespace, label_selector))
            .await
            .map_err(|_| DiscoveryError::Api(format!("listing pods in '{namespace}' timed out")))?
    }
}
