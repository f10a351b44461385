//! Registers the fixed backends declared in the config file.
use crate::endpoint::{EndpointId, EndpointRecord, Source, parse_static_base_url};
use crate::errors::ConfigError;
use crate::registry::Registry;
use crate::settings::InstanceConfig;
use std::collections::BTreeSet;
use tracing::info;

/// Validate every instance and register it. Nothing is registered unless all are valid.
pub fn load_static(
    instances: &[InstanceConfig],
    registry: &Registry,
) -> Result<usize, ConfigError> {
    let records = instances
        .iter()
        .enumerate()
        .map(|(index, instance)| build_record(index, instance))
        .collect::<Result<Vec<_>, _>>()?;

    let count = records.len();
    for record in records {
        info!(
            endpoint = %record.id,
            url = %record.base_url,
            models = ?record.models,
            "Registered static backend"
        );
        registry.upsert(record);
    }
    Ok(count)
}

fn build_record(index: usize, instance: &InstanceConfig) -> Result<EndpointRecord, ConfigError> {
    let endpoint = instance
        .endpoint
        .as_deref()
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or(ConfigError::MissingEndpoint { index })?;

    let base_url = parse_static_base_url(endpoint).map_err(|source| ConfigError::InvalidEndpoint {
        index,
        endpoint: endpoint.to_string(),
        source,
    })?;

    let models: BTreeSet<String> = instance
        .models
        .iter()
        .map(|model| model.trim())
        .filter(|model| !model.is_empty())
        .map(str::to_string)
        .collect();
    if models.is_empty() {
        return Err(ConfigError::NoModels {
            index,
            endpoint: endpoint.to_string(),
        });
    }

    Ok(EndpointRecord::builder()
        .id(EndpointId::for_static(index))
        .base_url(base_url)
        .credential(instance.credential.clone().unwrap_or_default())
        .models(models)
        .source(Source::Static)
        .build())
}
