use crate::errors::DiscoveryError;
use async_trait::async_trait;
use std::collections::HashMap;

/// What discovery needs to know about a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub ip: Option<String>,
    pub phase: String,
    pub annotations: HashMap<String, String>,
}

impl PodInfo {
    pub fn running(namespace: &str, name: &str, ip: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ip: Some(ip.to_string()),
            phase: "Running".to_string(),
            annotations: HashMap::new(),
        }
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }
}

/// Lists pods from the orchestration cluster.
#[async_trait]
pub trait PodLister: Send + Sync + std::fmt::Debug {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInfo>, DiscoveryError>;
}
