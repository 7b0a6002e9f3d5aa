use crate::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Points at a cloud resource either by its ID or by its name
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ResourceReference {
    #[must_use]
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: None,
        }
    }

    #[must_use]
    pub fn by_name(name: &str) -> Self {
        Self {
            id: None,
            name: Some(name.to_string()),
        }
    }
}

fn group_of(api_version: &str) -> &str {
    api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or_default()
}

fn same_kind(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.kind == b.kind && group_of(&a.api_version) == group_of(&b.api_version)
}

/// Builds a non-controller owner reference to `owner`, which must already be persisted
pub fn owner_reference<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let missing = |field| Error::MissingField {
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        field,
    };
    Ok(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.meta().name.clone().ok_or_else(|| missing("name"))?,
        uid: owner.meta().uid.clone().ok_or_else(|| missing("uid"))?,
        ..OwnerReference::default()
    })
}

/// True when `refs` already points at exactly `want` (same group, kind, name and uid)
#[must_use]
pub fn has_owner_ref(refs: &[OwnerReference], want: &OwnerReference) -> bool {
    refs.iter()
        .any(|r| same_kind(r, want) && r.name == want.name && r.uid == want.uid)
}

/// Adds `owner`, replacing any reference to the same group and kind so that
/// at most one owner of that kind remains. Returns true when `refs` changed.
pub fn ensure_owner_ref(refs: &mut Vec<OwnerReference>, owner: OwnerReference) -> bool {
    if has_owner_ref(refs, &owner) {
        return false;
    }
    refs.retain(|r| !same_kind(r, &owner));
    refs.push(owner);
    true
}
