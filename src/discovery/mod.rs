//! Periodic discovery of backend pods.
//!
//! Every interval the poller lists the pods of each configured source, works out which
//! models each running pod serves (from an annotation, or by probing its model listing),
//! and reconciles the registry against what it found. A source whose listing fails is
//! skipped for that pass and keeps its previous records.
//!
//! A running pod whose probe fails keeps its previous record for up to
//! `max_probe_failures - 1` passes, so a backend that is briefly slow to answer
//! `/models` is not dropped from rotation. After that many consecutive failures it is
//! evicted like a pod that disappeared.
pub mod kube;
pub mod pods;
pub mod probe;

pub use kube::KubeApiClient;
pub use pods::{PodInfo, PodLister};
pub use probe::ModelProber;

use crate::client::{HttpClient, PoolConfig, create_hyper_client};
use crate::endpoint::{
    EndpointId, EndpointRecord, PodAddressing, Source, SourceKey, parse_model_list,
};
use crate::errors::DiscoveryError;
use crate::registry::{ReconcileSummary, Registry};
use crate::settings::{DiscoverySettings, DiscoverySourceConfig, ProxySettings};
use bon::Builder;
use futures_util::StreamExt;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Probes in flight per source at once.
const PROBE_CONCURRENCY: usize = 8;

/// One namespace + label selector pair to watch.
#[derive(Debug, Clone)]
pub struct DiscoverySource {
    pub key: SourceKey,
    pub namespace: String,
    pub label_selector: String,
    pub model_annotation_key: Option<String>,
    pub credential: String,
}

impl From<&DiscoverySourceConfig> for DiscoverySource {
    fn from(config: &DiscoverySourceConfig) -> Self {
        Self {
            key: SourceKey::new(&config.namespace, &config.selector),
            namespace: config.namespace.clone(),
            label_selector: config.selector.clone(),
            model_annotation_key: config
                .model_annotation_key
                .clone()
                .filter(|key| !key.is_empty()),
            credential: config.credential.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Builder)]
pub struct DiscoveryPoller<C: HttpClient> {
    sources: Vec<DiscoverySource>,
    lister: Arc<dyn PodLister>,
    prober: ModelProber<C>,
    registry: Registry,
    interval: Duration,
    #[builder(default = "borg/".to_string())]
    annotation_prefix: String,
    #[builder(default = 3)]
    max_probe_failures: u32,
    #[builder(skip)]
    probe_failures: Mutex<HashMap<SourceKey, HashMap<EndpointId, u32>>>,
}

/// Build a poller for `configs` from the discovery settings.
pub fn poller_from_settings<C: HttpClient + Send + Sync>(
    configs: &[DiscoverySourceConfig],
    settings: &DiscoverySettings,
    interval: Duration,
    lister: Arc<dyn PodLister>,
    client: C,
    registry: Registry,
) -> DiscoveryPoller<C> {
    DiscoveryPoller::builder()
        .sources(configs.iter().map(DiscoverySource::from).collect())
        .lister(lister)
        .prober(ModelProber::new(client, settings.probe_timeout()))
        .registry(registry)
        .interval(interval)
        .annotation_prefix(settings.annotation_prefix.clone())
        .max_probe_failures(settings.max_probe_failures)
        .build()
}

/// Spawn the discovery poller described by `settings` against the Kubernetes API.
///
/// Returns `None` when discovery is disabled or the API client cannot be set up. The latter
/// is logged and the proxy keeps serving its static backends.
pub async fn start_discovery(
    settings: &ProxySettings,
    pool: PoolConfig,
    registry: Registry,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let Some(interval) = settings.discovery_interval() else {
        if !settings.k8s_discover.is_empty() {
            warn!("Discovery sources configured but update_interval is not positive, skipping");
        }
        return None;
    };

    let lister = match KubeApiClient::from_settings(&settings.discovery).await {
        Ok(lister) => lister,
        Err(e) => {
            error!(
                error = %e,
                "Failed to set up Kubernetes discovery, serving static backends only"
            );
            return None;
        }
    };

    let poller = poller_from_settings(
        &settings.k8s_discover,
        &settings.discovery,
        interval,
        Arc::new(lister),
        create_hyper_client(pool),
        registry,
    );
    Some(poller.spawn(shutdown))
}

impl<C: HttpClient + Send + Sync + 'static> DiscoveryPoller<C> {
    /// Poll until `shutdown` is cancelled. The first pass runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            sources = self.sources.len(),
            interval_secs = self.interval.as_secs(),
            "Starting discovery"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.poll_once() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Discovery stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

impl<C: HttpClient + Send + Sync> DiscoveryPoller<C> {
    /// Run one pass over every source concurrently.
    pub async fn poll_once(&self) -> Vec<(SourceKey, Result<ReconcileSummary, DiscoveryError>)> {
        let results = join_all(self.sources.iter().map(|source| async move {
            (source.key.clone(), self.poll_source(source).await)
        }))
        .await;

        for (key, result) in &results {
            match result {
                Ok(summary) if summary.added + summary.removed > 0 => {
                    info!(source = %key, "Discovery pass: {summary}");
                }
                Ok(summary) => debug!(source = %key, "Discovery pass: {summary}"),
                Err(e) => warn!(
                    source = %key,
                    error = %e,
                    "Discovery pass skipped, keeping previous endpoints"
                ),
            }
        }
        results
    }

    #[instrument(skip(self, source), fields(source = %source.key))]
    async fn poll_source(
        &self,
        source: &DiscoverySource,
    ) -> Result<ReconcileSummary, DiscoveryError> {
        let pods = self
            .lister
            .list_pods(&source.namespace, &source.label_selector)
            .await?;

        let running: Vec<(PodInfo, String)> = pods
            .into_iter()
            .filter(PodInfo::is_running)
            .filter_map(|pod| {
                let ip = pod.ip.clone()?;
                Some((pod, ip))
            })
            .collect();

        let outcomes: Vec<(EndpointId, Result<EndpointRecord, DiscoveryError>)> =
            futures_util::stream::iter(running)
                .map(|(pod, ip)| async move {
                    let id = EndpointId::for_pod(&source.key, &pod.name, &ip);
                    let record = self.describe_pod(source, &pod, &ip, id.clone()).await;
                    (id, record)
                })
                .buffered(PROBE_CONCURRENCY)
                .collect()
                .await;

        let mut fresh = Vec::with_capacity(outcomes.len());
        let mut failing = HashMap::new();
        {
            let mut failures = self
                .probe_failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let previous = failures.remove(&source.key).unwrap_or_default();
            for (id, outcome) in outcomes {
                let error = match outcome {
                    Ok(record) => {
                        fresh.push(record);
                        continue;
                    }
                    Err(e) => e,
                };
                if matches!(error, DiscoveryError::InvalidAnnotation { .. }) {
                    warn!(
                        endpoint = %id,
                        error = %error,
                        "Rejecting pod with unusable annotations"
                    );
                    continue;
                }
                let count = previous.get(&id).copied().unwrap_or(0) + 1;
                match self.registry.get(&id) {
                    Some(kept) if count < self.max_probe_failures => {
                        warn!(
                            endpoint = %id,
                            error = %error,
                            failures = count,
                            "Probe failed, keeping previous record"
                        );
                        fresh.push(EndpointRecord::clone(&kept));
                    }
                    _ => {
                        warn!(
                            endpoint = %id,
                            error = %error,
                            failures = count,
                            "Probe failed, endpoint not routable"
                        );
                    }
                }
                failing.insert(id, count);
            }
            // Counters of pods that are gone or healthy again are dropped with `previous`.
            if !failing.is_empty() {
                failures.insert(source.key.clone(), failing);
            }
        }

        Ok(self.registry.reconcile(&source.key, fresh))
    }

    /// Build the record for a running pod, probing it when no annotation lists its models.
    async fn describe_pod(
        &self,
        source: &DiscoverySource,
        pod: &PodInfo,
        ip: &str,
        id: EndpointId,
    ) -> Result<EndpointRecord, DiscoveryError> {
        let addressing =
            PodAddressing::from_annotations(&pod.annotations, &self.annotation_prefix)?;
        let base_url = addressing
            .base_url(ip)
            .map_err(|e| DiscoveryError::InvalidAnnotation {
                key: format!("{}protocol", self.annotation_prefix),
                value: addressing.protocol.clone(),
                reason: format!("invalid pod address: {e}"),
            })?;

        let annotated = source
            .model_annotation_key
            .as_ref()
            .and_then(|key| pod.annotations.get(key))
            .map(|value| parse_model_list(value))
            .unwrap_or_default();

        let mut record = EndpointRecord::builder()
            .id(id)
            .base_url(base_url)
            .credential(source.credential.clone())
            .models(annotated)
            .source(Source::Discovered(source.key.clone()))
            .build();
        if record.models.is_empty() {
            record.models = self
                .prober
                .probe(&record.models_url(), &source.credential)
                .await?;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHttpClient, MockPodLister, MockUpstream};
    use axum::http::StatusCode;
    use std::collections::BTreeSet;

    const NS: &str = "vllm-servers";
    const SELECTOR: &str = "borg/expose=vllm";

    fn source_config(modelkey: Option<&str>) -> DiscoverySourceConfig {
        DiscoverySourceConfig {
            namespace: NS.into(),
            selector: SELECTOR.into(),
            model_annotation_key: modelkey.map(str::to_string),
            credential: None,
        }
    }

    fn poller(
        configs: &[DiscoverySourceConfig],
        lister: &MockPodLister,
        client: &MockHttpClient,
        registry: &Registry,
        max_probe_failures: u32,
    ) -> DiscoveryPoller<MockHttpClient> {
        let settings = DiscoverySettings {
            max_probe_failures,
            ..Default::default()
        };
        poller_from_settings(
            configs,
            &settings,
            Duration::from_millis(20),
            Arc::new(lister.clone()),
            client.clone(),
            registry.clone(),
        )
    }

    fn pod_id(name: &str, ip: &str) -> EndpointId {
        EndpointId::for_pod(&SourceKey::new(NS, SELECTOR), name, ip)
    }

    fn models(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn test_annotated_running_pods_are_registered_without_probing() {
        let lister = MockPodLister::new();
        lister.set_pods(
            NS,
            SELECTOR,
            vec![
                PodInfo::running(NS, "vllm-0", "10.1.0.4")
                    .with_annotation("borg/models", "llama-3, mistral")
                    .with_annotation("borg/apiport", "8000"),
                PodInfo::running(NS, "vllm-1", "10.1.0.5")
                    .with_annotation("borg/models", "llama-3")
                    .with_phase("Pending"),
            ],
        );
        let client = MockHttpClient::new(StatusCode::OK, r#"{"data":[{"id":"unused"}]}"#);
        let registry = Registry::new();

        let configs = [source_config(Some("borg/models"))];
        let results = poller(&configs, &lister, &client, &registry, 3)
            .poll_once()
            .await;
        let summary = results[0].1.as_ref().unwrap();
        assert_eq!(summary.added, 1);

        let records = registry.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, pod_id("vllm-0", "10.1.0.4"));
        assert_eq!(records[0].base_url.as_str(), "http://10.1.0.4:8000/v1");
        assert_eq!(records[0].models, models(&["llama-3", "mistral"]));
        assert!(client.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_unannotated_pod_is_probed() {
        let lister = MockPodLister::new();
        lister.set_pods(
            NS,
            SELECTOR,
            vec![
                PodInfo::running(NS, "vllm-0", "10.1.0.4")
                    .with_annotation("borg/protocol", "https")
                    .with_annotation("borg/apibase", "/openai/v1"),
            ],
        );
        let client = MockHttpClient::new(StatusCode::OK, r#"{"data":[{"id":"qwen"}]}"#);
        let registry = Registry::new();
        let mut config = source_config(Some("borg/models"));
        config.credential = Some("sk-pods".into());

        poller(&[config], &lister, &client, &registry, 3)
            .poll_once()
            .await;

        let requests = client.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri, "https://10.1.0.4/openai/v1/models");
        assert_eq!(requests[0].header("authorization"), Some("Bearer sk-pods"));

        let record = registry
            .get(&pod_id("vllm-0", "10.1.0.4"))
            .unwrap();
        assert_eq!(record.models, models(&["qwen"]));
        assert_eq!(record.credential, "sk-pods");
    }

    #[tokio::test]
    async fn test_vanished_pod_is_evicted_and_static_records_survive() {
        let registry = Registry::new();
        crate::static_loader::load_static(
            &[crate::settings::InstanceConfig {
                endpoint: Some("http://static:8000".into()),
                credential: None,
                models: vec!["llama-3".into()],
            }],
            &registry,
        )
        .unwrap();

        let lister = MockPodLister::new();
        lister.set_pods(
            NS,
            SELECTOR,
            vec![
                PodInfo::running(NS, "vllm-0", "10.1.0.4")
                    .with_annotation("borg/models", "llama-3"),
            ],
        );
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let configs = [source_config(Some("borg/models"))];
        let poller = poller(&configs, &lister, &client, &registry, 3);

        poller.poll_once().await;
        assert_eq!(registry.candidates_for("llama-3").len(), 2);

        lister.set_pods(NS, SELECTOR, vec![]);
        let results = poller.poll_once().await;
        assert_eq!(results[0].1.as_ref().unwrap().removed, 1);

        let candidates = registry.candidates_for("llama-3");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].source, Source::Static);
    }

    #[tokio::test]
    async fn test_listing_failure_keeps_previous_records() {
        let lister = MockPodLister::new();
        lister.set_pods(
            NS,
            SELECTOR,
            vec![PodInfo::running(NS, "vllm-0", "10.1.0.4").with_annotation("borg/models", "m")],
        );
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let registry = Registry::new();
        let configs = [source_config(Some("borg/models"))];
        let poller = poller(&configs, &lister, &client, &registry, 3);

        poller.poll_once().await;
        lister.set_error(NS, SELECTOR, "connection refused");
        let results = poller.poll_once().await;

        assert!(matches!(results[0].1, Err(DiscoveryError::Api(_))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_probe_failures_keep_record_until_limit() {
        let lister = MockPodLister::new();
        lister.set_pods(NS, SELECTOR, vec![PodInfo::running(NS, "vllm-0", "10.1.0.4")]);
        let client = MockHttpClient::new(StatusCode::OK, r#"{"data":[{"id":"m"}]}"#);
        let registry = Registry::new();
        let poller = poller(&[source_config(None)], &lister, &client, &registry, 2);
        let id = pod_id("vllm-0", "10.1.0.4");

        poller.poll_once().await;
        assert!(registry.get(&id).is_some());

        client.set_upstream(
            "10.1.0.4",
            MockUpstream::respond(StatusCode::SERVICE_UNAVAILABLE, ""),
        );
        poller.poll_once().await;
        assert!(registry.get(&id).is_some(), "first failure keeps the record");

        poller.poll_once().await;
        assert!(registry.get(&id).is_none(), "second consecutive failure evicts");

        client.set_upstream(
            "10.1.0.4",
            MockUpstream::respond(StatusCode::OK, r#"{"data":[{"id":"m"}]}"#),
        );
        poller.poll_once().await;
        assert!(registry.get(&id).is_some(), "recovered pod is registered again");
    }

    #[tokio::test]
    async fn test_new_pod_with_failing_probe_is_not_registered() {
        let lister = MockPodLister::new();
        lister.set_pods(NS, SELECTOR, vec![PodInfo::running(NS, "vllm-0", "10.1.0.4")]);
        let client = MockHttpClient::new(StatusCode::OK, r#"{"unexpected": true}"#);
        let registry = Registry::new();

        poller(&[source_config(None)], &lister, &client, &registry, 3)
            .poll_once()
            .await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sources_are_reconciled_independently() {
        let lister = MockPodLister::new();
        lister.set_pods(
            NS,
            SELECTOR,
            vec![PodInfo::running(NS, "vllm-0", "10.1.0.4").with_annotation("borg/models", "a")],
        );
        lister.set_pods(
            "other",
            "app=tgi",
            vec![
                PodInfo::running("other", "tgi-0", "10.2.0.4").with_annotation("borg/models", "b"),
            ],
        );
        let other = DiscoverySourceConfig {
            namespace: "other".into(),
            selector: "app=tgi".into(),
            model_annotation_key: Some("borg/models".into()),
            credential: None,
        };
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let registry = Registry::new();
        let configs = [source_config(Some("borg/models")), other];
        let poller = poller(&configs, &lister, &client, &registry, 3);

        poller.poll_once().await;
        assert_eq!(registry.all_models(), models(&["a", "b"]));

        lister.set_error("other", "app=tgi", "forbidden");
        lister.set_pods(NS, SELECTOR, vec![]);
        poller.poll_once().await;
        assert_eq!(registry.all_models(), models(&["b"]));
    }

    #[tokio::test]
    async fn test_pod_with_unparseable_port_is_rejected() {
        let lister = MockPodLister::new();
        lister.set_pods(
            NS,
            SELECTOR,
            vec![
                PodInfo::running(NS, "vllm-0", "10.1.0.4")
                    .with_annotation("borg/models", "m")
                    .with_annotation("borg/apiport", "8000"),
            ],
        );
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let registry = Registry::new();
        let configs = [source_config(Some("borg/models"))];
        let poller = poller(&configs, &lister, &client, &registry, 3);

        poller.poll_once().await;
        assert_eq!(registry.len(), 1);

        lister.set_pods(
            NS,
            SELECTOR,
            vec![
                PodInfo::running(NS, "vllm-0", "10.1.0.4")
                    .with_annotation("borg/models", "m")
                    .with_annotation("borg/apiport", "abc"),
            ],
        );
        let results = poller.poll_once().await;

        assert_eq!(results[0].1.as_ref().unwrap().removed, 1);
        assert!(registry.is_empty(), "no record is kept for a pod with a bad port");
        assert!(client.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_pod_matched_by_overlapping_sources_is_owned_by_each() {
        let lister = MockPodLister::new();
        let pod = PodInfo::running(NS, "vllm-0", "10.1.0.4").with_annotation("borg/models", "m");
        lister.set_pods(NS, SELECTOR, vec![pod.clone()]);
        lister.set_pods(NS, "app=vllm", vec![pod]);
        let broad = DiscoverySourceConfig {
            selector: "app=vllm".into(),
            ..source_config(Some("borg/models"))
        };
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let registry = Registry::new();
        let configs = [source_config(Some("borg/models")), broad];
        let poller = poller(&configs, &lister, &client, &registry, 3);

        poller.poll_once().await;
        assert_eq!(registry.candidates_for("m").len(), 2);

        let results = poller.poll_once().await;
        for (_, result) in &results {
            let summary = result.as_ref().unwrap();
            assert_eq!((summary.added, summary.removed), (0, 0));
            assert_eq!(summary.refreshed, 1);
        }
        assert_eq!(registry.candidates_for("m").len(), 2);
    }

    fn discovery_settings(api_server: &str) -> ProxySettings {
        ProxySettings {
            update_interval: Some(60),
            k8s_discover: vec![source_config(Some("borg/models"))],
            discovery: DiscoverySettings {
                api_server: Some(api_server.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_discovery_setup_failure_is_not_fatal() {
        let registry = Registry::new();
        let handle = start_discovery(
            &discovery_settings("not a url"),
            PoolConfig::default(),
            registry.clone(),
            CancellationToken::new(),
        )
        .await;

        assert!(handle.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_start_discovery_spawns_poller_until_cancelled() {
        let shutdown = CancellationToken::new();
        let handle = start_discovery(
            &discovery_settings("http://127.0.0.1:1"),
            PoolConfig::default(),
            Registry::new(),
            shutdown.clone(),
        )
        .await
        .expect("api_server is valid");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller should stop after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_discovery_disabled_without_interval() {
        let mut settings = discovery_settings("http://127.0.0.1:1");
        settings.update_interval = None;
        let handle = start_discovery(
            &settings,
            PoolConfig::default(),
            Registry::new(),
            CancellationToken::new(),
        )
        .await;
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_run_polls_until_cancelled() {
        let lister = MockPodLister::new();
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let registry = Registry::new();
        let shutdown = CancellationToken::new();

        let handle = poller(&[source_config(None)], &lister, &client, &registry, 3)
            .spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(70)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller should stop after cancellation")
            .unwrap();

        assert!(lister.calls().len() >= 2);
    }
}
