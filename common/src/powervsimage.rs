use crate::{
    conditions::{Condition, HasConditions},
    states::ImageState,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static IMAGE_FINALIZER: &str = "ibmpowervsimage.infrastructure.cluster.x-k8s.io";

pub static IMAGE_IMPORTED_CONDITION: &str = "ImageImported";
pub static IMAGE_READY_CONDITION: &str = "ImageReady";
pub static IMAGE_NOT_READY_REASON: &str = "ImageNotReady";
pub static IMAGE_IMPORT_FAILED_REASON: &str = "ImageImportFailed";

/// A boot image imported into a PowerVS workspace from object storage
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "IBMPowerVSImage",
    root = "PowerVsImage",
    status = "PowerVsImageStatus",
    shortname = "ibmpowervsimage",
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a PowerVS boot image imported from a COS bucket",
    printcolumn = r#"
    {"name":"State",  "type":"string", "description":"Image state", "jsonPath":".status.imageState"},
    {"name":"Ready",  "type":"boolean", "description":"Image ready", "jsonPath":".status.ready"},
    {"name":"Image",  "type":"string", "description":"Image ID", "jsonPath":".status.imageId", "priority": 1},
    {"name":"errors", "type":"string", "description":"Errors", "jsonPath":".status.conditions[?(@.status == 'False')].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PowerVsImageSpec {
    /// Name of the owning IBMPowerVSCluster
    pub cluster_name: String,
    /// Workspace to import into; defaults to the cluster's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Image file name inside the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    /// Bucket region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default = "default_storage_type")]
    pub storage_type: String,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
}

fn default_storage_type() -> String {
    "tier1".to_string()
}

/// What happens to the imported image when the resource goes away
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    #[default]
    Delete,
    Retain,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PowerVsImageStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Import job in flight; no other job is started while it is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_state: Option<ImageState>,
    /// Workspace the job and image were created in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PowerVsWorkspace>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PowerVsWorkspace {
    pub service_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl HasConditions for PowerVsImageStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

impl PowerVsImage {
    #[must_use]
    pub fn image_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.image_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.job_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}
