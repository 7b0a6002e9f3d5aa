use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{kind} {name} has no {field}")]
    MissingField {
        kind: String,
        name: String,
        field: &'static str,
    },

    #[error("Error: {0}")]
    Other(String),
}
impl Error {
    #[must_use]
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// API group shared by every infrastructure kind handled here
pub static API_GROUP: &str = "infrastructure.cluster.x-k8s.io";
pub static API_VERSION: &str = "v1beta2";
/// Label naming the owning cluster
pub static CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// Label present on machines that belong to a control plane
pub static CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane-name";

pub mod conditions;
pub mod references;
pub mod states;

pub mod powervscluster;
pub mod powervsimage;
pub mod vpccluster;
pub mod vpcmachine;

pub use conditions::{Condition, ConditionSeverity, ConditionStatus, HasConditions};
pub use powervscluster::PowerVsCluster;
pub use powervsimage::PowerVsImage;
pub use states::{ImageState, InstanceStatus, JobState};
pub use vpccluster::VpcCluster;
pub use vpcmachine::VpcMachine;
