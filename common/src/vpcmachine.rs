use crate::{
    conditions::{Condition, HasConditions},
    references::ResourceReference,
    states::InstanceStatus,
    CONTROL_PLANE_LABEL,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static MACHINE_FINALIZER: &str = "ibmvpcmachine.infrastructure.cluster.x-k8s.io";

pub static INSTANCE_READY_CONDITION: &str = "InstanceReady";
pub static INSTANCE_NOT_READY_REASON: &str = "InstanceNotReady";
pub static INSTANCE_STOPPED_REASON: &str = "InstanceStopped";
pub static INSTANCE_ERRORED_REASON: &str = "InstanceErrored";
pub static INSTANCE_STATE_UNKNOWN_REASON: &str = "InstanceStateUnknown";
/// Failure reason recorded when the provider reports the instance as failed
pub static UPDATE_MACHINE_ERROR: &str = "UpdateError";

/// A virtual server instance in an IBM Cloud VPC
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "IBMVPCMachine",
    root = "VpcMachine",
    status = "VpcMachineStatus",
    shortname = "ibmvpcmachine",
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a VPC virtual server backing a cluster machine",
    printcolumn = r#"
    {"name":"Cluster",  "type":"string", "description":"Owning cluster", "jsonPath":".metadata.labels.cluster\\.x-k8s\\.io/cluster-name"},
    {"name":"State",    "type":"string", "description":"Instance state", "jsonPath":".status.instanceStatus"},
    {"name":"Ready",    "type":"boolean", "description":"Machine ready", "jsonPath":".status.ready"},
    {"name":"Instance", "type":"string", "description":"Instance ID", "jsonPath":".status.instanceId", "priority": 1},
    {"name":"errors",   "type":"string", "description":"Errors", "jsonPath":".status.conditions[?(@.status == 'False')].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VpcMachineSpec {
    /// Instance name, defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub zone: String,
    pub profile: String,
    pub image: ResourceReference,
    #[serde(default)]
    pub ssh_keys: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_network_interface: Option<NetworkInterface>,
    /// Secret holding the bootstrap user data under the `value` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_data_secret_name: Option<String>,
    /// Explicit load balancer pool memberships; when empty, control-plane
    /// machines join the cluster's API server load balancer
    #[serde(default)]
    pub load_balancer_pool_members: Vec<LoadBalancerPoolMember>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPoolMember {
    pub load_balancer: ResourceReference,
    pub pool: ResourceReference,
    pub port: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
pub enum AddressType {
    InternalIP,
    ExternalIP,
    Hostname,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub type_: AddressType,
    pub address: String,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VpcMachineStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// VPC region the instance is created in, kept for teardown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_status: Option<InstanceStatus>,
    /// Opaque external identifier, written once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub addresses: Vec<MachineAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HasConditions for VpcMachineStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

impl VpcMachine {
    /// Name given to the provider instance
    #[must_use]
    pub fn instance_name(&self) -> String {
        self.spec.name.clone().unwrap_or_else(|| self.name_any())
    }

    #[must_use]
    pub fn is_control_plane(&self) -> bool {
        self.labels().contains_key(CONTROL_PLANE_LABEL)
    }

    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.instance_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.region.as_deref())
            .filter(|r| !r.is_empty())
    }

    #[must_use]
    pub fn internal_address(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| {
            s.addresses
                .iter()
                .find(|a| a.type_ == AddressType::InternalIP)
                .map(|a| a.address.as_str())
        })
    }
}
