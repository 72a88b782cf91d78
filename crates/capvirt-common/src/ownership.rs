//! Ownership and provenance of dependent objects
//!
//! Every VM, DataVolume and Service created by a reconciler records which
//! object created it. Objects created in the management cluster get a
//! controller owner reference so that Kubernetes garbage collection cleans
//! them up. Objects created in a separate infrastructure cluster cannot point
//! at an owner UID that does not exist there, so they only carry the
//! [`OWNER_ANNOTATION`]. Both markers are checked when deciding whether an
//! existing object with the expected name is ours.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::Error;

/// Annotation recording `<Kind>/<namespace>/<name>/<uid>` of the creating object
pub const OWNER_ANNOTATION: &str = "capvirt.io/owner";

/// Where a dependent object is stored relative to its owner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Same cluster as the owner; owner references are valid
    Local,
    /// A different cluster; only the provenance annotation is recorded
    Remote,
}

/// Identity of an object that creates dependents
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
    uid: String,
}

impl Owner {
    /// Identity of a stored object
    ///
    /// Fails for objects that were never persisted and therefore have no UID.
    pub fn of<K>(obj: &K) -> Result<Self, Error>
    where
        K: Resource<DynamicType = ()>,
    {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let uid = obj.meta().uid.clone().ok_or_else(|| {
            Error::validation_for(format!("{namespace}/{name}"), "object has no uid")
        })?;
        Ok(Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            namespace,
            name,
            uid,
        })
    }

    /// Value stored under [`OWNER_ANNOTATION`]
    pub fn annotation_value(&self) -> String {
        format!("{}/{}/{}/{}", self.kind, self.namespace, self.name, self.uid)
    }

    /// Controller owner reference pointing at this owner
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Record provenance on the metadata of a dependent about to be created
    pub fn stamp(&self, meta: &mut ObjectMeta, placement: Placement) {
        meta.annotations
            .get_or_insert_with(Default::default)
            .insert(OWNER_ANNOTATION.to_string(), self.annotation_value());
        if placement == Placement::Local {
            let refs = meta.owner_references.get_or_insert_with(Vec::new);
            refs.retain(|r| r.controller != Some(true));
            refs.push(self.owner_reference());
        }
    }

    /// Whether `meta` belongs to an object created by this owner
    pub fn owns(&self, meta: &ObjectMeta) -> bool {
        let annotated = meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(OWNER_ANNOTATION))
            .is_some_and(|v| *v == self.annotation_value());
        let referenced = meta.owner_references.as_ref().is_some_and(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.uid == self.uid)
        });
        annotated || referenced
    }
}

/// Owner reference of the given group and kind, regardless of version
pub fn find_owner_reference<'a>(
    meta: &'a ObjectMeta,
    group: &str,
    kind: &str,
) -> Option<&'a OwnerReference> {
    meta.owner_references.as_ref()?.iter().find(|r| {
        r.kind == kind && r.api_version.split('/').next() == Some(group)
    })
}
