use crate::references::ResourceReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Port the API server listens on when the endpoint does not say otherwise
pub const DEFAULT_API_SERVER_PORT: i32 = 6443;

/// Cluster-wide VPC infrastructure, reconciled elsewhere and only read by the machine controller
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "IBMVPCCluster",
    root = "VpcCluster",
    status = "VpcClusterStatus",
    shortname = "ibmvpccluster",
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    namespaced
)]
#[kube(
    doc = "Cluster infrastructure living in an IBM Cloud VPC",
    printcolumn = r#"
    {"name":"Region", "type":"string", "description":"VPC region", "jsonPath":".spec.region"},
    {"name":"Ready",  "type":"boolean", "description":"Infrastructure ready", "jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VpcClusterSpec {
    /// VPC region
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<ResourceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    pub host: String,
    pub port: i32,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerReference {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VpcClusterStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    /// Load balancer fronting the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_load_balancer: Option<LoadBalancerReference>,
}

impl VpcCluster {
    #[must_use]
    pub fn api_server_port(&self) -> i32 {
        self.spec
            .control_plane_endpoint
            .as_ref()
            .map(|e| e.port)
            .filter(|p| *p > 0)
            .unwrap_or(DEFAULT_API_SERVER_PORT)
    }

    #[must_use]
    pub fn subnet_id(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.subnet_id.as_deref())
    }

    #[must_use]
    pub fn vpc_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.vpc_id.as_deref())
            .or_else(|| self.spec.vpc.as_ref().and_then(|v| v.id.as_deref()))
    }

    #[must_use]
    pub fn control_plane_load_balancer(&self) -> Option<&LoadBalancerReference> {
        self.status
            .as_ref()
            .and_then(|s| s.control_plane_load_balancer.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_server_port_defaults() {
        let mut c = VpcCluster::new("c1", VpcClusterSpec {
            region: "us-south".into(),
            resource_group: None,
            vpc: None,
            control_plane_endpoint: None,
        });
        assert_eq!(c.api_server_port(), 6443);
        c.spec.control_plane_endpoint = Some(ApiEndpoint {
            host: "10.0.0.1".into(),
            port: 0,
        });
        assert_eq!(c.api_server_port(), 6443);
        c.spec.control_plane_endpoint = Some(ApiEndpoint {
            host: "10.0.0.1".into(),
            port: 443,
        });
        assert_eq!(c.api_server_port(), 443);
    }
}
