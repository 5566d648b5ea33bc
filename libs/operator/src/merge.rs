use serde_json::{Map, Value};

use crate::crd::common::{ObjectRefSpec, ResolvedCluster, ValuesSpec};
use crate::crd::stack::EnvLabel;
use crate::error::{Error, Result};
use crate::fleet::FleetClient;

/// The conventional key under which a plain `configMapRefs`/`secretRefs` entry
/// stores a single values blob, when the referenced object carries exactly
/// one relevant key. When it carries several, every key is treated as its own
/// YAML values document and merged in (sorted) key order — the same
/// single-key-per-cluster convention used explicitly for `perClusterConfigMapRef`
/// (`"{clusterId}.yaml"`), generalized to the unscoped refs. See `DESIGN.md`.
const VALUES_KEY: &str = "values.yaml";

/// Deep-merges `overlay` into `base` in place: nested objects merge key by
/// key, arrays are replaced wholesale (not concatenated), and scalars
/// overwrite. Matches Helm values-file merge expectations.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            merge_maps(base_map, overlay_map);
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}

fn merge_maps(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, overlay_value) in overlay {
        match base.get_mut(&key) {
            Some(existing) => deep_merge(existing, overlay_value),
            None => {
                base.insert(key, overlay_value);
            }
        }
    }
}

fn parse_yaml_blob(kind: &'static str, namespace: &str, name: &str, blob: &str) -> Result<Value> {
    serde_yaml::from_str(blob).map_err(|e| Error::ParseFailure {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
        message: e.to_string(),
    })
}

/// Merges every key of a ConfigMap/Secret's string data into `acc`, in sorted
/// key order, each parsed as its own YAML document.
fn merge_all_keys(acc: &mut Value, kind: &'static str, namespace: &str, name: &str, data: &std::collections::BTreeMap<String, String>) -> Result<()> {
    if let Some(blob) = data.get(VALUES_KEY) {
        let parsed = parse_yaml_blob(kind, namespace, name, blob)?;
        deep_merge(acc, parsed);
        return Ok(());
    }
    for (_key, blob) in data.iter() {
        let parsed = parse_yaml_blob(kind, namespace, name, blob)?;
        deep_merge(acc, parsed);
    }
    Ok(())
}

fn ref_namespace(r: &ObjectRefSpec, default_namespace: &str) -> String {
    r.namespace.clone().unwrap_or_else(|| default_namespace.to_string())
}

/// Runs the full values-merge pipeline for one (values, cluster) pair, then
/// injects the reserved `herd.security.enabled`/`herd.observability.enabled`
/// keys after the merge so user values cannot suppress them.
pub async fn render_values(
    client: &dyn FleetClient,
    stack_namespace: &str,
    values: &ValuesSpec,
    env: EnvLabel,
    cluster: &ResolvedCluster,
    security: bool,
    observability: bool,
) -> Result<Value> {
    let mut acc = Value::Object(Map::new());

    // 1. configMapRefs, declared order, lowest precedence.
    for r in &values.config_map_refs {
        let ns = ref_namespace(r, stack_namespace);
        let data = client
            .get_config_map(&ns, &r.name)
            .await?
            .ok_or_else(|| Error::MissingValueSource {
                kind: "ConfigMap",
                namespace: ns.clone(),
                name: r.name.clone(),
            })?;
        merge_all_keys(&mut acc, "ConfigMap", &ns, &r.name, &data)?;
    }

    // 2. environment overlay, silently skipped if absent.
    let overlay_name = env.overlay_config_map_name();
    if let Some(data) = client.get_config_map(stack_namespace, &overlay_name).await? {
        merge_all_keys(&mut acc, "ConfigMap", stack_namespace, &overlay_name, &data)?;
    }

    // 3. perClusterConfigMapRef, keyed by "{cluster.id}.yaml"; missing key is a no-op.
    if let Some(r) = &values.per_cluster_config_map_ref {
        let ns = ref_namespace(r, stack_namespace);
        let data = client
            .get_config_map(&ns, &r.name)
            .await?
            .ok_or_else(|| Error::MissingValueSource {
                kind: "ConfigMap",
                namespace: ns.clone(),
                name: r.name.clone(),
            })?;
        let key = format!("{}.yaml", cluster.id);
        if let Some(blob) = data.get(&key) {
            let parsed = parse_yaml_blob("ConfigMap", &ns, &r.name, blob)?;
            deep_merge(&mut acc, parsed);
        }
    }

    // 4. secretRefs, declared order. Payloads are parsed identically to
    // ConfigMaps but their content never flows into logs/events/status.
    for r in &values.secret_refs {
        let ns = ref_namespace(r, stack_namespace);
        let data = client
            .get_secret(&ns, &r.name)
            .await?
            .ok_or_else(|| Error::MissingValueSource {
                kind: "Secret",
                namespace: ns.clone(),
                name: r.name.clone(),
            })?;
        let as_strings: std::collections::BTreeMap<String, String> = data
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
            .collect();
        merge_all_keys(&mut acc, "Secret", &ns, &r.name, &as_strings)?;
    }

    // 5. inline, highest precedence.
    if let Some(inline) = &values.inline {
        deep_merge(&mut acc, inline.clone());
    }

    // Reserved feature-toggle keys, injected after the merge so user values
    // cannot suppress them.
    let herd_key = acc
        .as_object_mut()
        .expect("acc is always an object")
        .entry("herd")
        .or_insert_with(|| Value::Object(Map::new()));
    if !herd_key.is_object() {
        *herd_key = Value::Object(Map::new());
    }
    let herd_map = herd_key.as_object_mut().unwrap();
    herd_map.insert(
        "security".to_string(),
        serde_json::json!({ "enabled": security }),
    );
    herd_map.insert(
        "observability".to_string(),
        serde_json::json!({ "enabled": observability }),
    );

    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::{FleetWorkspace, LabelSelectorSpec};
    use crate::fleet::fake::FakeFleetClient;
    use std::collections::BTreeMap;

    fn cluster(id: &str) -> ResolvedCluster {
        ResolvedCluster {
            id: id.to_string(),
            labels: BTreeMap::new(),
            workspace: FleetWorkspace::FleetDefault,
        }
    }

    #[test]
    fn deep_merge_maps_merge_keys_arrays_replace_scalars_overwrite() {
        let mut base = serde_json::json!({
            "a": 1,
            "nested": {"x": 1, "y": 2},
            "list": [1, 2, 3],
        });
        let overlay = serde_json::json!({
            "a": 2,
            "nested": {"y": 20, "z": 30},
            "list": [9],
        });
        deep_merge(&mut base, overlay);
        assert_eq!(
            base,
            serde_json::json!({
                "a": 2,
                "nested": {"x": 1, "y": 20, "z": 30},
                "list": [9],
            })
        );
    }

    #[tokio::test]
    async fn full_precedence_lattice_s2_scenario() {
        let client = FakeFleetClient::default();
        client.put_config_map("ns", "cm1", BTreeMap::from([(
            VALUES_KEY.to_string(),
            "a: 1\nb: 1\n".to_string(),
        )]));
        client.put_config_map("ns", "herd-env-prod", BTreeMap::from([(
            VALUES_KEY.to_string(),
            "b: 2\nc: 2\n".to_string(),
        )]));
        client.put_config_map("ns", "per-cluster", BTreeMap::from([(
            "c-a.yaml".to_string(),
            "c: 3\nd: 3\n".to_string(),
        )]));
        client.put_secret("ns", "s1", BTreeMap::from([(
            VALUES_KEY.to_string(),
            b"d: 4\ne: 4\n".to_vec(),
        )]));

        let values = ValuesSpec {
            inline: Some(serde_json::json!({"e": 5})),
            config_map_refs: vec![ObjectRefSpec { name: "cm1".to_string(), namespace: None }],
            secret_refs: vec![ObjectRefSpec { name: "s1".to_string(), namespace: None }],
            per_cluster_config_map_ref: Some(ObjectRefSpec { name: "per-cluster".to_string(), namespace: None }),
        };

        let rendered = render_values(&client, "ns", &values, EnvLabel::Prod, &cluster("c-a"), false, false)
            .await
            .unwrap();

        assert_eq!(rendered["a"], serde_json::json!(1));
        assert_eq!(rendered["b"], serde_json::json!(2));
        assert_eq!(rendered["c"], serde_json::json!(3));
        assert_eq!(rendered["d"], serde_json::json!(4));
        assert_eq!(rendered["e"], serde_json::json!(5));
    }

    #[tokio::test]
    async fn missing_env_overlay_is_silently_skipped() {
        let client = FakeFleetClient::default();
        let values = ValuesSpec::default();
        let rendered = render_values(&client, "ns", &values, EnvLabel::Dev, &cluster("c-a"), false, false)
            .await
            .unwrap();
        assert!(rendered.is_object());
    }

    #[tokio::test]
    async fn missing_config_map_ref_is_permanent_failure() {
        let client = FakeFleetClient::default();
        let values = ValuesSpec {
            config_map_refs: vec![ObjectRefSpec { name: "ghost".to_string(), namespace: None }],
            ..Default::default()
        };
        let err = render_values(&client, "ns", &values, EnvLabel::Dev, &cluster("c-a"), false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingValueSource { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn missing_per_cluster_key_is_a_no_op() {
        let client = FakeFleetClient::default();
        client.put_config_map("ns", "per-cluster", BTreeMap::from([(
            "c-other.yaml".to_string(),
            "z: 1\n".to_string(),
        )]));
        let values = ValuesSpec {
            per_cluster_config_map_ref: Some(ObjectRefSpec { name: "per-cluster".to_string(), namespace: None }),
            ..Default::default()
        };
        let rendered = render_values(&client, "ns", &values, EnvLabel::Dev, &cluster("c-a"), false, false)
            .await
            .unwrap();
        assert!(rendered.get("z").is_none());
    }

    #[tokio::test]
    async fn toggles_injected_after_merge_cannot_be_suppressed() {
        let client = FakeFleetClient::default();
        let values = ValuesSpec {
            inline: Some(serde_json::json!({"herd": {"security": {"enabled": false}}})),
            ..Default::default()
        };
        let rendered = render_values(&client, "ns", &values, EnvLabel::Dev, &cluster("c-a"), true, false)
            .await
            .unwrap();
        assert_eq!(rendered["herd"]["security"]["enabled"], serde_json::json!(true));
        assert_eq!(rendered["herd"]["observability"]["enabled"], serde_json::json!(false));
    }

    #[test]
    fn label_selector_spec_default_is_empty() {
        assert!(LabelSelectorSpec::default().match_labels.is_empty());
    }
}
