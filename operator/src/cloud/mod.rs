//! Provider-facing capabilities.
//!
//! Controllers only see the [`VpcClient`] and [`PowerVsClient`] traits; the
//! [`http`] module talks to the real IBM Cloud endpoints.
use async_trait::async_trait;
use common::{ImageState, InstanceStatus, JobState};
use std::{fmt, sync::Arc};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub mod http;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{method} {url} failed with {status}: {message}")]
    Api {
        method: String,
        url: String,
        status: u16,
        message: String,
    },

    #[error("Reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unexpected provider response: {0}")]
    Unexpected(String),
}

impl CloudError {
    /// Not found is the only error that means "already gone"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReason {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub crn: Option<String>,
    pub status: InstanceStatus,
    pub primary_ip: Option<String>,
    pub health_reasons: Vec<HealthReason>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct InstancePrototype {
    pub name: String,
    pub zone: String,
    pub profile: String,
    pub vpc: Option<String>,
    pub subnet: String,
    pub image_id: Option<String>,
    pub image_name: Option<String>,
    pub ssh_keys: Vec<String>,
    pub resource_group: Option<String>,
    pub user_data: Option<String>,
}

/// Provisioning status shared by load balancers and their pool members
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisioningStatus {
    Active,
    CreatePending,
    UpdatePending,
    DeletePending,
    Failed,
    Unknown(String),
}

impl From<&str> for ProvisioningStatus {
    fn from(raw: &str) -> Self {
        match raw {
            "active" => ProvisioningStatus::Active,
            "create_pending" => ProvisioningStatus::CreatePending,
            "update_pending" => ProvisioningStatus::UpdatePending,
            "delete_pending" => ProvisioningStatus::DeletePending,
            "failed" => ProvisioningStatus::Failed,
            other => ProvisioningStatus::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningStatus::Active => f.write_str("active"),
            ProvisioningStatus::CreatePending => f.write_str("create_pending"),
            ProvisioningStatus::UpdatePending => f.write_str("update_pending"),
            ProvisioningStatus::DeletePending => f.write_str("delete_pending"),
            ProvisioningStatus::Failed => f.write_str("failed"),
            ProvisioningStatus::Unknown(raw) => f.write_str(raw),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolRef {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancer {
    pub id: String,
    pub name: String,
    pub provisioning_status: ProvisioningStatus,
    pub pools: Vec<PoolRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolMember {
    pub id: String,
    pub address: Option<String>,
    pub port: i64,
    pub provisioning_status: ProvisioningStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub state: JobState,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub state: ImageState,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ImageImportRequest {
    pub image_name: String,
    pub bucket: String,
    pub object: String,
    pub region: String,
    pub storage_type: String,
}

/// Compute, tagging and load balancer calls against a VPC region
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VpcClient: Send + Sync {
    async fn get_instance(&self, id: &str) -> CloudResult<Option<Instance>>;
    async fn get_instance_by_name(&self, name: &str) -> CloudResult<Option<Instance>>;
    async fn create_instance(&self, prototype: &InstancePrototype) -> CloudResult<Instance>;
    async fn delete_instance(&self, id: &str) -> CloudResult<()>;
    /// Attach a user tag to the resource identified by `crn`
    async fn tag_resource(&self, tag: &str, crn: &str) -> CloudResult<()>;

    async fn get_load_balancer(&self, id: &str) -> CloudResult<Option<LoadBalancer>>;
    async fn get_load_balancer_by_name(&self, name: &str) -> CloudResult<Option<LoadBalancer>>;
    async fn list_load_balancer_pool_members(&self, lb_id: &str, pool_id: &str) -> CloudResult<Vec<PoolMember>>;
    async fn create_load_balancer_pool_member(
        &self,
        lb_id: &str,
        pool_id: &str,
        address: &str,
        port: i64,
        weight: Option<i64>,
    ) -> CloudResult<PoolMember>;
    async fn delete_load_balancer_pool_member(&self, lb_id: &str, pool_id: &str, member_id: &str) -> CloudResult<()>;
}

/// Image import calls against one PowerVS workspace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PowerVsClient: Send + Sync {
    async fn create_image_import_job(&self, request: &ImageImportRequest) -> CloudResult<String>;
    async fn get_job(&self, id: &str) -> CloudResult<Job>;
    async fn delete_job(&self, id: &str) -> CloudResult<()>;
    async fn get_all_images(&self) -> CloudResult<Vec<ImageReference>>;
    async fn get_image(&self, id: &str) -> CloudResult<Image>;
    async fn delete_image(&self, id: &str) -> CloudResult<()>;
}

/// Where a PowerVS client should point
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PowerVsTarget {
    pub service_instance_id: Option<String>,
    pub zone: Option<String>,
    pub region: Option<String>,
}

/// Hands out clients bound to a region or workspace
pub trait CloudProvider: Send + Sync {
    fn vpc(&self, region: Option<&str>) -> Arc<dyn VpcClient>;
    fn powervs(&self, target: &PowerVsTarget) -> Arc<dyn PowerVsClient>;
}
