//! Upstream output resolution.
//!
//! Before a downstream module runs, the outputs of its upstream modules'
//! latest successful applies are remapped into its variables via the
//! dependency edge's declared mapping. Resolution is read-only and copies
//! values verbatim — scalars, arrays, and nested objects alike.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::store::Store;

/// Resolve the variables contributed by a module's upstream dependencies.
///
/// Each dependency with a non-empty mapping requires the upstream module to
/// have a succeeded apply with recorded `tf_outputs`; a dependency with an
/// empty mapping contributes nothing and imposes no requirement.
pub fn resolve_module_inputs(store: &dyn Store, module_id: Uuid) -> Result<Map<String, Value>> {
    let mut resolved = Map::new();
    for dep in store.list_dependencies_of_module(module_id)? {
        if dep.output_mapping.is_empty() {
            continue;
        }

        let upstream_name = store
            .get_module(dep.depends_on_id)?
            .map(|m| m.name)
            .unwrap_or_else(|| dep.depends_on_id.to_string());

        let outputs = store
            .latest_successful_apply(dep.depends_on_id)?
            .and_then(|run| run.tf_outputs)
            .ok_or_else(|| RegistryError::UpstreamNotReady(upstream_name.clone()))?;
        let outputs = outputs
            .as_object()
            .ok_or_else(|| RegistryError::UpstreamNotReady(upstream_name.clone()))?;

        for mapping in &dep.output_mapping {
            let Some(value) = outputs.get(&mapping.upstream_output) else {
                let mut available: Vec<String> = outputs.keys().cloned().collect();
                available.sort();
                return Err(RegistryError::UpstreamOutputMissing {
                    key: mapping.upstream_output.clone(),
                    available,
                });
            };
            resolved.insert(mapping.downstream_variable.clone(), value.clone());
        }
    }
    Ok(resolved)
}

/// Overlay resolved upstream values onto a variables snapshot. Resolved
/// values win over snapshot values of the same name.
pub fn merge_variables(snapshot: &Value, resolved: &Map<String, Value>) -> Value {
    let mut merged = snapshot.as_object().cloned().unwrap_or_default();
    for (key, value) in resolved {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overrides_snapshot() {
        let snapshot = json!({"region": "eu-west-1", "vpc_id": "stale"});
        let mut resolved = Map::new();
        resolved.insert("vpc_id".to_string(), json!("vpc-123"));
        let merged = merge_variables(&snapshot, &resolved);
        assert_eq!(merged, json!({"region": "eu-west-1", "vpc_id": "vpc-123"}));
    }

    #[test]
    fn test_merge_tolerates_non_object_snapshot() {
        let mut resolved = Map::new();
        resolved.insert("a".to_string(), json!(1));
        let merged = merge_variables(&Value::Null, &resolved);
        assert_eq!(merged, json!({"a": 1}));
    }
}
