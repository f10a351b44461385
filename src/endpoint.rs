//! Endpoint records: one per backend instance the proxy knows about.
//!
//! Records come from two places. Static ones are built once from the config file; discovered
//! ones are rebuilt on every discovery pass from a pod's IP and annotations. Either way the
//! record carries everything needed to forward a request: where to send it, which models it
//! serves, and the credential the backend expects.
use crate::errors::DiscoveryError;
use bon::Builder;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::SystemTime;
use url::Url;

/// Stable identity of an endpoint within the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn for_static(index: usize) -> Self {
        Self(format!("static/{index}"))
    }

    /// Pods are identified by source, name and IP. A pod that comes back with a new IP is a
    /// new endpoint and the old one is evicted; a pod matched by two sources gets one record
    /// per source.
    pub fn for_pod(source: &SourceKey, name: &str, ip: &str) -> Self {
        Self(format!("pod/{source}/{name}/{ip}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one discovery source, so reconciliation only touches that source's records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn new(namespace: &str, selector: &str) -> Self {
        Self(format!("{namespace}/{selector}"))
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Static,
    Discovered(SourceKey),
}

/// A backend instance and the models it serves.
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct EndpointRecord {
    pub id: EndpointId,
    /// Scheme, host, port and API base (e.g. `http://10.0.0.5:8000/v1`).
    pub base_url: Url,
    /// Sent as `Authorization: Bearer {credential}` to this backend. Empty means none.
    #[builder(default)]
    pub credential: String,
    pub models: BTreeSet<String>,
    pub source: Source,
    #[builder(default = SystemTime::now())]
    pub last_seen: SystemTime,
}

impl EndpointRecord {
    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    /// Build the URL for a call whose inbound path was `/v1{rest}`.
    ///
    /// `rest` is everything after the API base, starting with `/` (e.g. `/chat/completions`).
    pub fn upstream_url(&self, rest: &str, query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        let rest = rest.trim_start_matches('/');
        url.set_path(&format!("{base}/{rest}"));
        url.set_query(query);
        url
    }

    /// The `/models` listing endpoint under this record's API base.
    pub fn models_url(&self) -> Url {
        self.upstream_url("/models", None)
    }
}

/// Annotations that shape how a pod is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAddressing {
    pub protocol: String,
    pub port: Option<u16>,
    pub api_base: String,
}

impl PodAddressing {
    /// Read `{prefix}protocol`, `{prefix}apiport` and `{prefix}apibase`, with defaults
    /// `http`, the protocol's default port and `/v1`. A port that is not a number is an error.
    pub fn from_annotations(
        annotations: &HashMap<String, String>,
        prefix: &str,
    ) -> Result<Self, DiscoveryError> {
        let get = |key: &str| {
            annotations
                .get(&format!("{prefix}{key}"))
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        let port = match get("apiport") {
            Some(port) => Some(port.parse().map_err(|e: std::num::ParseIntError| {
                DiscoveryError::InvalidAnnotation {
                    key: format!("{prefix}apiport"),
                    value: port.to_string(),
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };

        Ok(Self {
            protocol: get("protocol").unwrap_or("http").to_ascii_lowercase(),
            port,
            api_base: get("apibase").unwrap_or("/v1").to_string(),
        })
    }

    pub fn base_url(&self, ip: &str) -> Result<Url, url::ParseError> {
        // IPv6 pod addresses need brackets in the authority.
        let host = if ip.contains(':') && !ip.starts_with('[') {
            format!("[{ip}]")
        } else {
            ip.to_string()
        };
        let authority = match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let api_base = self.api_base.trim_end_matches('/');
        let api_base = if api_base.is_empty() || api_base.starts_with('/') {
            api_base.to_string()
        } else {
            format!("/{api_base}")
        };
        Url::parse(&format!("{}://{authority}{api_base}", self.protocol))
    }
}

/// Parse a delimited model list from an annotation value. Commas, semicolons and whitespace
/// all separate names; empty entries are dropped.
pub fn parse_model_list(value: &str) -> BTreeSet<String> {
    value
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a static instance endpoint, defaulting the API base to `/v1` when no path is given.
pub fn parse_static_base_url(endpoint: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(endpoint.trim())?;
    if url.cannot_be_a_base() {
        return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
    }
    if url.path().trim_matches('/').is_empty() {
        url.set_path("/v1");
    }
    Ok(url)
}
