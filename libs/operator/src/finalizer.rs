use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::crd::common::FINALIZER;
use crate::error::Result;

/// Adds `herd.suse.com/finalizer` to the object named `name` in `namespace`,
/// as a JSON patch that is a no-op if the finalizer is already present.
/// Generic over resource kind so both `Stack` and `Pipeline` share it.
pub async fn add<K>(client: Client, name: &str, namespace: &str) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let api: Api<K> = Api::namespaced(client, namespace);
    let finalizer = serde_json::json!({
        "metadata": {
            "finalizers": [FINALIZER]
        }
    });
    Ok(api
        .patch(name, &PatchParams::default(), &Patch::Merge(&finalizer))
        .await?)
}

/// Removes `herd.suse.com/finalizer` from the object named `name` in
/// `namespace`, leaving any other finalizers untouched.
pub async fn delete<K>(client: Client, name: &str, namespace: &str) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let current = api.get(name).await?;
    let remaining: Vec<String> = current
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": remaining
        }
    });
    Ok(api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

/// True iff the object does not yet carry `herd.suse.com/finalizer`.
pub fn needs_finalizer<K: ResourceExt>(obj: &K) -> bool {
    !obj.finalizers().iter().any(|f| f == FINALIZER)
}
