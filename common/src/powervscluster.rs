use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PowerVS workspace backing a cluster; only read by the image controller
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "IBMPowerVSCluster",
    root = "PowerVsCluster",
    status = "PowerVsClusterStatus",
    shortname = "ibmpowervscluster",
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    namespaced
)]
#[kube(doc = "Cluster infrastructure living in an IBM Power Virtual Server workspace")]
#[serde(rename_all = "camelCase")]
pub struct PowerVsClusterSpec {
    /// PowerVS workspace (cloud instance) ID
    pub service_instance_id: String,
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
pub struct PowerVsClusterStatus {
    #[serde(default)]
    pub ready: bool,
}
