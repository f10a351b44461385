/// Axum handlers for the proxy server
use crate::client::HttpClient;
use crate::dispatch::ProxiedRequest;
use crate::errors::ProxyError;
use crate::models::ListModelResponse;
use crate::{AppState, extract_model_from_request};
use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use http_body_util::{BodyExt, Limited};
use serde_json::json;
use tracing::{debug, info, instrument};

/// Largest request body the proxy will buffer for replay.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Forwards `POST /v1/*` to a backend serving the requested model.
///
/// The caller is authenticated before the body is read, so a rejected caller never
/// causes a backend call.
#[instrument(skip(state, req), fields(path = %req.uri().path()))]
pub async fn proxy_handler<T: HttpClient + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    req: axum::extract::Request,
) -> Result<Response, ProxyError> {
    let caller = state.rewriter.authenticate(req.headers())?;

    let (parts, body) = req.into_parts();
    let body = Limited::new(body, MAX_REQUEST_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| ProxyError::BadRequest(format!("failed to read request body: {e}")))?
        .to_bytes();
    debug!("Received request body of size: {}", body.len());

    let model = extract_model_from_request(&parts.headers, &body)?;
    info!(model = %model, caller = %caller, "Received request");

    let candidates = state.resolver.candidates_for(&model)?;
    let candidates = state.balancer.order(&model, candidates);

    let path = parts
        .uri
        .path()
        .strip_prefix("/v1")
        .unwrap_or(parts.uri.path())
        .to_string();
    let request = ProxiedRequest {
        model,
        method: parts.method,
        path,
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };

    state.dispatcher.dispatch(&request, candidates).await
}

/// Lists every model any known backend serves. No backend is contacted.
#[instrument(skip(state))]
pub async fn models<T: HttpClient>(State(state): State<AppState<T>>) -> impl IntoResponse {
    Json(ListModelResponse::from_names(&state.resolver.list_models()))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "detail": "Proxy router is running"}))
}
