//! End-of-pass persistence of the provider's own objects
//!
//! A pass works on a copy of the object it was handed. When it succeeds, the
//! difference between the original and the copy becomes one JSON merge patch
//! for the object (finalizers, labels, annotations and spec) and one for the
//! status subresource. Both carry the resourceVersion the pass started from,
//! so a concurrent writer makes the pass fail with 409 instead of being
//! silently overwritten.

use kube::api::{Api, Patch, PatchParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use capvirt_common::{Error, FIELD_MANAGER};

/// Changes to persist at the end of a pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectPatch {
    /// resourceVersion the pass read
    pub resource_version: Option<String>,
    /// Merge patch for metadata and spec
    pub object: Option<Value>,
    /// Merge patch for the status subresource
    pub status: Option<Value>,
}

impl ObjectPatch {
    /// Patch turning `before` into `after`
    pub fn between<K>(before: &K, after: &K) -> Result<Self, Error>
    where
        K: Resource + Serialize,
    {
        let before_json = serde_json::to_value(before)?;
        let after_json = serde_json::to_value(after)?;

        Ok(Self {
            resource_version: before.meta().resource_version.clone(),
            object: merge_diff(&persisted_fields(&before_json), &persisted_fields(&after_json)),
            status: merge_diff(
                before_json.get("status").unwrap_or(&Value::Null),
                after_json.get("status").unwrap_or(&Value::Null),
            ),
        })
    }

    /// Whether the pass changed nothing
    pub fn is_empty(&self) -> bool {
        self.object.is_none() && self.status.is_none()
    }
}

/// The parts of an object a reconciler may change outside of status
fn persisted_fields(obj: &Value) -> Value {
    let meta = |key: &str| obj.pointer(&format!("/metadata/{key}")).cloned().unwrap_or(Value::Null);
    json!({
        "metadata": {
            "finalizers": meta("finalizers"),
            "labels": meta("labels"),
            "annotations": meta("annotations"),
        },
        "spec": obj.get("spec").cloned().unwrap_or(Value::Null),
    })
}

/// RFC 7386 merge patch turning `before` into `after`, `None` when equal
pub fn merge_diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) => {
                        if let Some(diff) = merge_diff(previous, value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None if value.is_null() => {}
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if before == after => None,
        _ => Some(after.clone()),
    }
}

/// Send an [`ObjectPatch`] to the API server
///
/// Status goes first: once the object patch removes the last finalizer the
/// object may be gone.
pub async fn apply_patch<K>(api: &Api<K>, name: &str, patch: &ObjectPatch) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let params = PatchParams::apply(FIELD_MANAGER);
    let mut resource_version = patch.resource_version.clone();

    if let Some(status) = &patch.status {
        let body = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        let updated = api
            .patch_status(name, &params, &Patch::Merge(&body))
            .await
            .map_err(|e| Error::store(format!("patch status of {name}"), e))?;
        resource_version = updated.meta().resource_version.clone();
        debug!(name, "status persisted");
    }

    if let Some(object) = &patch.object {
        let mut body = object.clone();
        body["metadata"]["resourceVersion"] = json!(resource_version);
        api.patch(name, &params, &Patch::Merge(&body))
            .await
            .map_err(|e| Error::store(format!("patch {name}"), e))?;
        debug!(name, "object persisted");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use capvirt_common::crd::{VirtinkMachine, VirtinkMachineSpec, VirtinkMachineStatus};
    use capvirt_common::FINALIZER;

    fn machine() -> VirtinkMachine {
        let mut m = VirtinkMachine::new("m-0", VirtinkMachineSpec::default());
        m.metadata.namespace = Some("capi".to_string());
        m.metadata.resource_version = Some("41".to_string());
        m
    }

    #[test]
    fn equal_values_produce_no_patch() {
        let v = json!({"a": 1, "b": {"c": [1, 2]}});
        assert_eq!(merge_diff(&v, &v), None);
    }

    #[test]
    fn nested_changes_and_removals() {
        let before = json!({"a": 1, "b": {"c": "x", "d": "y"}, "gone": true});
        let after = json!({"a": 1, "b": {"c": "z", "d": "y"}, "new": [1]});
        assert_eq!(
            merge_diff(&before, &after),
            Some(json!({"b": {"c": "z"}, "gone": null, "new": [1]}))
        );
    }

    #[test]
    fn arrays_are_replaced_whole() {
        let before = json!({"f": ["a"]});
        let after = json!({"f": ["a", "b"]});
        assert_eq!(merge_diff(&before, &after), Some(json!({"f": ["a", "b"]})));
    }

    #[test]
    fn untouched_object_is_empty() {
        let m = machine();
        let patch = ObjectPatch::between(&m, &m.clone()).expect("diff");
        assert!(patch.is_empty());
        assert_eq!(patch.resource_version.as_deref(), Some("41"));
    }

    #[test]
    fn finalizer_only_touches_metadata() {
        let before = machine();
        let mut after = before.clone();
        after.metadata.finalizers = Some(vec![FINALIZER.to_string()]);

        let patch = ObjectPatch::between(&before, &after).expect("diff");
        assert_eq!(
            patch.object,
            Some(json!({"metadata": {"finalizers": [FINALIZER]}}))
        );
        assert!(patch.status.is_none());
    }

    #[test]
    fn status_and_spec_are_split() {
        let before = machine();
        let mut after = before.clone();
        after.spec.provider_id = Some("virtink://uid-1".to_string());
        after.status = Some(VirtinkMachineStatus {
            ready: true,
            ..Default::default()
        });

        let patch = ObjectPatch::between(&before, &after).expect("diff");
        assert_eq!(
            patch.object,
            Some(json!({"spec": {"providerID": "virtink://uid-1"}}))
        );
        assert_eq!(patch.status, Some(json!({"ready": true})));
    }

    #[test]
    fn removed_finalizer_is_cleared() {
        let mut before = machine();
        before.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        let mut after = before.clone();
        after.metadata.finalizers = Some(vec![]);

        let patch = ObjectPatch::between(&before, &after).expect("diff");
        assert_eq!(patch.object, Some(json!({"metadata": {"finalizers": []}})));
    }
}
