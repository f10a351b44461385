//! The proxy's configuration file.
//!
//! The file is JSON, either bare or wrapped in a top-level `"borg"` object:
//!
//! ```json
//! {
//!   "borg": {
//!     "auth_key": "saMmbffqDb0ZeqJM4abNz4gKV4PFzqz2gmeoGNiRo3I=",
//!     "auth_prefix": "BORG:",
//!     "update_interval": 5,
//!     "instances": [
//!       { "endpoint": "http://10.0.0.5:8000", "apikey": "sk-examplekey123", "models": ["gpt-3.5-turbo"] }
//!     ],
//!     "k8s_discover": [
//!       { "namespace": "vllm-servers", "selector": "borg/expose=vllm", "modelkey": "borg/models" }
//!     ]
//!   }
//! }
//! ```
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_AUTH_PREFIX: &str = "BORG:";

/// A fixed backend declared in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    /// Left optional so a missing endpoint is reported by the static loader with its index.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, alias = "apikey")]
    pub credential: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

/// Where and how to look for backend pods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySourceConfig {
    pub namespace: String,
    #[serde(alias = "label_selector")]
    pub selector: String,
    #[serde(default, alias = "modelkey")]
    pub model_annotation_key: Option<String>,
    /// Key sent to every pod found by this source. Most in-cluster backends need none.
    #[serde(default, alias = "apikey")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FanoutPolicy {
    /// Try candidates one after another until one succeeds.
    #[default]
    Sequential,
    /// Send to every candidate at once, keep the first success, drop the rest.
    Race,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Balance {
    /// Registry order, every time.
    InOrder,
    /// Rotate the starting candidate per model on each request.
    #[default]
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSettings {
    #[serde(default)]
    pub policy: FanoutPolicy,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default)]
    pub balance: Balance,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            policy: FanoutPolicy::default(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            balance: Balance::default(),
        }
    }
}

impl DispatchSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySettings {
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Consecutive failed model probes tolerated for a still-running pod before it is evicted.
    #[serde(default = "default_max_probe_failures")]
    pub max_probe_failures: u32,
    #[serde(default = "default_annotation_prefix")]
    pub annotation_prefix: String,
    /// API server to talk to instead of the in-cluster one, e.g. `http://127.0.0.1:8001`.
    #[serde(default)]
    pub api_server: Option<String>,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout_secs(),
            max_probe_failures: default_max_probe_failures(),
            annotation_prefix: default_annotation_prefix(),
            api_server: None,
            token_file: None,
        }
    }
}

impl DiscoverySettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_attempt_timeout_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_max_probe_failures() -> u32 {
    3
}

fn default_annotation_prefix() -> String {
    "borg/".to_string()
}

fn default_auth_prefix() -> String {
    DEFAULT_AUTH_PREFIX.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxySettings {
    /// Base64-url encoded 32-byte key. `"EMPTY"` is treated as unset.
    #[serde(default)]
    pub auth_key: Option<String>,
    #[serde(default = "default_auth_prefix")]
    pub auth_prefix: String,
    /// Reject callers without a prefixed token whenever a key is configured.
    #[serde(default)]
    pub require_token: bool,
    /// Seconds between discovery passes. Absent, zero or negative disables discovery.
    #[serde(default)]
    pub update_interval: Option<i64>,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub k8s_discover: Vec<DiscoverySourceConfig>,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            auth_key: None,
            auth_prefix: default_auth_prefix(),
            require_token: false,
            update_interval: None,
            instances: Vec::new(),
            k8s_discover: Vec::new(),
            dispatch: DispatchSettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

impl ProxySettings {
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let settings = Self::from_json(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        info!(
            "Loaded config from {}: {} static instances, {} discovery sources",
            path.display(),
            settings.instances.len(),
            settings.k8s_discover.len()
        );
        Ok(settings)
    }

    /// Parse a config document. When a top-level `"borg"` key is present, its value is the
    /// configuration and any error inside it is reported as is.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let mut document: Value = serde_json::from_str(contents)?;
        let wrapped = document.get_mut("borg").map(Value::take);
        serde_json::from_value(wrapped.unwrap_or(document))
    }

    /// The polling interval, if discovery is enabled at all.
    pub fn discovery_interval(&self) -> Option<Duration> {
        match self.update_interval {
            Some(secs) if secs > 0 && !self.k8s_discover.is_empty() => {
                Some(Duration::from_secs(secs.unsigned_abs()))
            }
            _ => None,
        }
    }

    /// The configured key, with the `"EMPTY"` placeholder folded into `None`.
    pub fn auth_key(&self) -> Option<&str> {
        self.auth_key
            .as_deref()
            .filter(|key| !key.is_empty() && *key != "EMPTY")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_config_with_python_style_aliases() {
        let settings = ProxySettings::from_json(
            r#"{
                "borg": {
                    "auth_key": "EMPTY",
                    "update_interval": 5,
                    "instances": [
                        {"endpoint": "http://10.0.0.5:8000", "apikey": "sk-1", "models": ["gpt-3.5-turbo"]}
                    ],
                    "k8s_discover": [
                        {"namespace": "vllm-servers", "selector": "borg/expose=vllm", "modelkey": "borg/models"}
                    ]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.auth_key(), None);
        assert_eq!(settings.auth_prefix, DEFAULT_AUTH_PREFIX);
        assert_eq!(settings.instances[0].credential.as_deref(), Some("sk-1"));
        assert_eq!(
            settings.k8s_discover[0].model_annotation_key.as_deref(),
            Some("borg/models")
        );
        assert_eq!(settings.discovery_interval(), Some(Duration::from_secs(5)));
        assert_eq!(settings.dispatch, DispatchSettings::default());
    }

    #[test]
    fn test_bare_config_and_dispatch_section() {
        let settings = ProxySettings::from_json(
            r#"{
                "instances": [],
                "dispatch": {"policy": "race", "attempt_timeout_secs": 3, "balance": "in_order"},
                "discovery": {"max_probe_failures": 1}
            }"#,
        )
        .unwrap();

        assert_eq!(settings.dispatch.policy, FanoutPolicy::Race);
        assert_eq!(settings.dispatch.attempt_timeout(), Duration::from_secs(3));
        assert_eq!(settings.dispatch.balance, Balance::InOrder);
        assert_eq!(settings.discovery.max_probe_failures, 1);
        assert_eq!(settings.discovery.annotation_prefix, "borg/");
    }

    #[test]
    fn test_discovery_disabled_without_interval_or_sources() {
        let mut settings = ProxySettings {
            update_interval: Some(0),
            k8s_discover: vec![DiscoverySourceConfig {
                namespace: "default".into(),
                selector: "app=vllm".into(),
                model_annotation_key: None,
                credential: None,
            }],
            ..Default::default()
        };
        assert_eq!(settings.discovery_interval(), None);

        settings.update_interval = Some(-1);
        assert_eq!(settings.discovery_interval(), None);

        settings.update_interval = Some(10);
        assert_eq!(settings.discovery_interval(), Some(Duration::from_secs(10)));

        settings.k8s_discover.clear();
        assert_eq!(settings.discovery_interval(), None);
    }

    #[test]
    fn test_malformed_wrapped_config_is_an_error() {
        let result = ProxySettings::from_json(
            r#"{"borg": {"instances": [{"endpoint": 5, "models": ["m"]}], "update_interval": 5}}"#,
        );
        assert!(result.is_err());

        let result = ProxySettings::from_json(r#"{"borg": {"update_interval": "soon"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_instance_without_endpoint_still_parses() {
        let settings =
            ProxySettings::from_json(r#"{"instances": [{"models": ["m"]}]}"#).unwrap();
        assert_eq!(settings.instances[0].endpoint, None);
    }
}
