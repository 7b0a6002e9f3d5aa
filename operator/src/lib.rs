use kube::runtime::controller::Action;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Resource error: {0}")]
    ResourceError(#[from] common::Error),

    #[error("Cloud error: {0}")]
    CloudError(#[from] cloud::CloudError),

    #[error("{kind} {namespace}/{name} not found")]
    ClusterNotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{0} does not name its owning cluster")]
    MissingClusterName(String),

    #[error("Conflict while persisting {0}, giving up after {1} attempts")]
    Conflict(String, u32),

    #[error("failed to import image, message: {0}")]
    ImportFailed(String),

    #[error("invalid primary ip address")]
    InvalidPrimaryIp,

    #[error("load balancer {0} not found")]
    MissingLoadBalancer(String),

    #[error("pool {pool} not found in load balancer {load_balancer}")]
    MissingPool { load_balancer: String, pool: String },

    #[error("bootstrap data secret {0} has no usable value")]
    MissingBootstrapData(String),

    #[error("cannot tell where the cloud resources of {0} live")]
    UnknownTarget(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Carries how long to wait before the next attempt
    #[error("{source}")]
    Requeue {
        after: Duration,
        #[source]
        source: Box<Error>,
    },

    #[error("Reconcile deadline exceeded: {0}")]
    Elapsed(#[source] tokio::time::error::Elapsed),

    #[error("Reconcile panicked: {0}")]
    Panicked(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    #[must_use]
    pub fn metric_label(&self) -> String {
        match self {
            Error::Context { source, .. } | Error::Requeue { source, .. } => source.metric_label(),
            other => format!("{other:?}")
                .split(['(', ' ', '{'])
                .next()
                .unwrap_or_default()
                .to_lowercase(),
        }
    }

    /// Interval the failing pass asked for, if any
    #[must_use]
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::Requeue { after, .. } => Some(*after),
            Error::Context { source, .. } => source.requeue_after(),
            _ => None,
        }
    }

    #[must_use]
    pub fn with_requeue(self, after: Duration) -> Error {
        Error::Requeue {
            after,
            source: Box::new(self),
        }
    }

    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Error {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::CloudError(e) => e.is_not_found(),
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            Error::Context { source, .. } | Error::Requeue { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// What the work queue should do with a key once a pass is over
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for the next change notification
    None,
    Immediate,
    After(Duration),
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Action {
        match requeue {
            Requeue::None => Action::await_change(),
            Requeue::Immediate => Action::requeue(Duration::ZERO),
            Requeue::After(after) => Action::requeue(after),
        }
    }
}

pub mod cloud;
pub mod config;
pub mod events;
pub mod loadbalancer;
pub mod scope;
pub mod store;

pub mod powervsimage;
pub mod vpcmachine;

/// State machinery for kube, as exposeable to actix
pub mod manager;
pub use manager::Manager;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub mod testing;
