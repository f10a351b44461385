//! Answers "which models exist" and "who serves model X" from the registry.
use crate::endpoint::EndpointRecord;
use crate::errors::ProxyError;
use crate::registry::Registry;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ModelResolver {
    registry: Registry,
}

impl ModelResolver {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// The model union across every registered endpoint, sorted by name.
    pub fn list_models(&self) -> BTreeSet<String> {
        self.registry.all_models()
    }

    /// Endpoints serving `model`, in registry order.
    pub fn candidates_for(&self, model: &str) -> Result<Vec<Arc<EndpointRecord>>, ProxyError> {
        let candidates = self.registry.candidates_for(model);
        if candidates.is_empty() {
            return Err(ProxyError::ModelNotFound(model.to_string()));
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointId, Source, SourceKey};

    fn record(id: EndpointId, source: Source, models: &[&str]) -> EndpointRecord {
        EndpointRecord::builder()
            .id(id)
            .base_url("http://backend:8000/v1".parse().unwrap())
            .models(models.iter().map(|m| m.to_string()).collect())
            .source(source)
            .build()
    }

    #[test]
    fn test_list_models_is_deduplicated_union() {
        let registry = Registry::new();
        let source = SourceKey::new("default", "app=vllm");
        registry.upsert(record(
            EndpointId::for_static(0),
            Source::Static,
            &["gpt-3.5-turbo"],
        ));
        registry.reconcile(
            &source,
            vec![record(
                EndpointId::for_pod(&source, "p", "10.0.0.2"),
                Source::Discovered(source.clone()),
                &["gpt-3.5-turbo", "gpt-4"],
            )],
        );

        let resolver = ModelResolver::new(registry);
        assert_eq!(
            resolver.list_models().into_iter().collect::<Vec<_>>(),
            vec!["gpt-3.5-turbo".to_string(), "gpt-4".to_string()]
        );
    }

    #[test]
    fn test_unknown_model_is_not_found() {
        let resolver = ModelResolver::new(Registry::new());
        let err = resolver.candidates_for("gpt-4").unwrap_err();
        assert!(matches!(err, ProxyError::ModelNotFound(model) if model == "gpt-4"));
    }

    #[test]
    fn test_candidates_in_registry_order() {
        let registry = Registry::new();
        registry.upsert(record(EndpointId::for_static(1), Source::Static, &["m"]));
        registry.upsert(record(EndpointId::for_static(0), Source::Static, &["m"]));

        let resolver = ModelResolver::new(registry);
        let ids: Vec<_> = resolver
            .candidates_for("m")
            .unwrap()
            .iter()
            .map(|record| record.id.clone())
            .collect();
        assert_eq!(ids, vec![EndpointId::for_static(1), EndpointId::for_static(0)]);
    }
}
