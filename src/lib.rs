//! Borg - a cluster-aware load-balancing proxy for OpenAI-compatible backends
//!
//! Backends come from two places: fixed instances in the config file and pods discovered
//! in a Kubernetes cluster. Both land in one [`registry::Registry`]; each inbound request
//! is routed by its `model` to the endpoints serving it, with the caller's credential
//! swapped for the backend's own.

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod auth;
pub mod client;
pub mod discovery;
pub mod dispatch;
pub mod endpoint;
pub mod errors;
pub mod handlers;
pub mod load_balancer;
pub mod models;
pub mod registry;
pub mod resolver;
pub mod settings;
pub mod static_loader;
#[doc(hidden)]
pub mod test_utils;

use auth::CredentialRewriter;
use client::{HttpClient, HyperClient, PoolConfig};
use dispatch::Dispatcher;
use errors::ProxyError;
use handlers::{health, models as models_handler, proxy_handler};
use load_balancer::LoadBalancer;
use models::ExtractedModel;
use registry::Registry;
use resolver::ModelResolver;
use settings::DispatchSettings;

const MODEL_OVERRIDE_HEADER: &str = "model-override";

/// The main application state shared by every handler
#[derive(Debug)]
pub struct AppState<T: HttpClient> {
    pub resolver: ModelResolver,
    pub rewriter: Arc<CredentialRewriter>,
    pub dispatcher: Arc<Dispatcher<T>>,
    pub balancer: Arc<LoadBalancer>,
}

impl<T: HttpClient> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            rewriter: Arc::clone(&self.rewriter),
            dispatcher: Arc::clone(&self.dispatcher),
            balancer: Arc::clone(&self.balancer),
        }
    }
}

impl AppState<HyperClient> {
    /// Create a new AppState with a pooled Hyper client
    pub fn new(
        registry: Registry,
        rewriter: CredentialRewriter,
        dispatch: &DispatchSettings,
        pool: PoolConfig,
    ) -> Self {
        Self::with_client(registry, rewriter, dispatch, client::create_hyper_client(pool))
    }
}

impl<T: HttpClient + Send + Sync> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(
        registry: Registry,
        rewriter: CredentialRewriter,
        dispatch: &DispatchSettings,
        http_client: T,
    ) -> Self {
        let rewriter = Arc::new(rewriter);
        Self {
            resolver: ModelResolver::new(registry),
            dispatcher: Arc::new(Dispatcher::new(http_client, Arc::clone(&rewriter), dispatch)),
            balancer: Arc::new(LoadBalancer::new(dispatch.balance)),
            rewriter,
        }
    }
}

/// Extract the model name from a request
///
/// The `model-override` header wins; otherwise the `model` field of the JSON body is used.
/// Anything else is a bad request.
pub fn extract_model_from_request(
    headers: &HeaderMap,
    body_bytes: &[u8],
) -> Result<String, ProxyError> {
    let model = match headers.get(MODEL_OVERRIDE_HEADER) {
        Some(header_value) => header_value
            .to_str()
            .map_err(|_| ProxyError::BadRequest("model-override header is not valid text".into()))?
            .trim()
            .to_string(),
        None => {
            let extracted: ExtractedModel = serde_json::from_slice(body_bytes).map_err(|e| {
                ProxyError::BadRequest(format!("body must be JSON with a 'model' field: {e}"))
            })?;
            extracted.model.to_string()
        }
    };

    if model.is_empty() {
        return Err(ProxyError::BadRequest("model must not be empty".into()));
    }
    Ok(model)
}

/// Build the main router for the proxy
/// This creates routes for:
/// - `/` - Liveness
/// - `/v1/models` - Returns the union of models served by known backends
/// - `/v1/{*path}` - Forwards POSTs to a backend serving the requested model
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/", get(health))
        .route("/v1/models", get(models_handler))
        .route("/v1/{*path}", post(proxy_handler))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` names every metric, e.g. `borg_http_requests_total`.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
