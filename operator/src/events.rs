use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
};

#[cfg(test)]
use mockall::automock;

/// Publishes observability events about a reconciled object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, ev: Event, regarding: ObjectReference) -> Result<()>;
}

pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    #[must_use]
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, ev: Event, regarding: ObjectReference) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding);
        match recorder.publish(ev).await {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(src)) => {
                // namespace being terminated and friends, nothing we can do
                tracing::warn!("Ignoring {:?} while sending an event", src);
                Ok(())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

#[must_use]
pub fn warning(reason: &str, note: String, action: &str) -> Event {
    Event {
        type_: EventType::Warning,
        reason: reason.to_string(),
        note: Some(note),
        action: action.to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn failed_build_instance(message: &str) -> Event {
    warning(
        "FailedBuildInstance",
        format!("Failed to build the instance - {message}"),
        "CreateInstance",
    )
}

#[must_use]
pub fn finalizer_removed(kind: &str, name: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "Deleted".to_string(),
        note: Some(format!("Released cloud resources of {kind} {name}")),
        action: "Delete".to_string(),
        secondary: None,
    }
}
