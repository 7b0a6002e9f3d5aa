use crate::{
    Error, Requeue, Result,
    cloud::CloudProvider,
    events::EventPublisher,
    manager::Context,
    store::{ResourceStore, is_conflict},
};
use common::{
    CLUSTER_NAME_LABEL, ConditionSeverity, HasConditions,
    references::{ensure_owner_ref, has_owner_ref, owner_reference},
};
use futures::{FutureExt, future::BoxFuture};
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt, runtime::events::Event};
use std::{any::Any, fmt::Debug, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, warn};

/// Everything the generic scope needs to know about a reconciled kind
pub trait Declared:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Send + Sync + 'static
{
    type Status: HasConditions + Clone + Default + PartialEq + Debug + Send + Sync;
    type Cluster: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Send + Sync + 'static;
    type Cloud: ?Sized + Send + Sync;

    fn finalizer() -> &'static str;
    fn cluster_name(&self) -> Option<String>;
    fn status(&self) -> Option<&Self::Status>;
    fn status_slot(&mut self) -> &mut Option<Self::Status>;
    fn connect(&self, cluster: Option<&Self::Cluster>, provider: &dyn CloudProvider) -> Arc<Self::Cloud>;
    fn stores(ctx: &Context) -> (Arc<dyn ResourceStore<Self>>, Arc<dyn ResourceStore<Self::Cluster>>);
}

/// One reconcile pass worth of state for a single object.
///
/// Mutations only touch the in-memory copy; [`Scope::close`] writes what changed.
pub struct Scope<K: Declared> {
    store: Arc<dyn ResourceStore<K>>,
    events: Arc<dyn EventPublisher>,
    original: K,
    resource: K,
    cluster: Option<K::Cluster>,
    cloud: Arc<K::Cloud>,
    close_retries: u32,
}

async fn resolve_cluster<K: Declared>(
    resource: &K,
    clusters: &dyn ResourceStore<K::Cluster>,
) -> Result<Option<K::Cluster>> {
    // best effort while deleting: teardown falls back to what status recorded
    let deleting = resource.meta().deletion_timestamp.is_some();
    let namespace = resource.namespace().unwrap_or_default();
    let Some(name) = resource.cluster_name().filter(|n| !n.is_empty()) else {
        if deleting {
            return Ok(None);
        }
        return Err(Error::MissingClusterName(format!(
            "{} {}/{}",
            K::kind(&()),
            namespace,
            resource.name_any()
        )));
    };
    match clusters.get(&namespace, &name).await {
        Ok(Some(cluster)) => Ok(Some(cluster)),
        Ok(None) if deleting => {
            debug!("{} {namespace}/{name} is gone, tearing down without it", <K::Cluster as Resource>::kind(&()));
            Ok(None)
        }
        Ok(None) => Err(Error::ClusterNotFound {
            kind: <K::Cluster as Resource>::kind(&()).to_string(),
            namespace,
            name,
        }),
        Err(e) if deleting => {
            warn!("Ignoring {e} while resolving the cluster of a deleted object");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn has_finalizer<K: Declared>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == K::finalizer())
}

impl<K: Declared> Scope<K> {
    /// Resolves the owning cluster and binds a cloud client for it
    pub async fn new(resource: K, ctx: &Context) -> Result<Self> {
        let (store, clusters) = K::stores(ctx);
        let cluster = resolve_cluster(&resource, clusters.as_ref()).await?;
        let cloud = resource.connect(cluster.as_ref(), ctx.cloud.as_ref());
        Ok(Self::from_parts(
            resource,
            cluster,
            cloud,
            store,
            ctx.events.clone(),
            ctx.settings.close_retries,
        ))
    }

    pub fn from_parts(
        resource: K,
        cluster: Option<K::Cluster>,
        cloud: Arc<K::Cloud>,
        store: Arc<dyn ResourceStore<K>>,
        events: Arc<dyn EventPublisher>,
        close_retries: u32,
    ) -> Self {
        Self {
            store,
            events,
            original: resource.clone(),
            resource,
            cluster,
            cloud,
            close_retries,
        }
    }

    pub fn resource(&self) -> &K {
        &self.resource
    }

    pub fn cluster(&self) -> Option<&K::Cluster> {
        self.cluster.as_ref()
    }

    pub fn cloud(&self) -> Arc<K::Cloud> {
        self.cloud.clone()
    }

    pub fn name(&self) -> String {
        self.resource.name_any()
    }

    pub fn namespace(&self) -> String {
        self.resource.namespace().unwrap_or_default()
    }

    /// `namespace/name`, for logs and errors
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn is_deleting(&self) -> bool {
        self.resource.meta().deletion_timestamp.is_some()
    }

    pub fn status(&self) -> Option<&K::Status> {
        self.resource.status()
    }

    pub fn status_mut(&mut self) -> &mut K::Status {
        self.resource.status_slot().get_or_insert_with(Default::default)
    }

    pub fn mark_true(&mut self, type_: &str) {
        self.status_mut().mark_true(type_);
    }

    pub fn mark_false(&mut self, type_: &str, reason: &str, severity: ConditionSeverity, message: &str) {
        self.status_mut().mark_false(type_, reason, severity, message);
    }

    pub fn mark_unknown(&mut self, type_: &str, reason: &str, message: &str) {
        self.status_mut().mark_unknown(type_, reason, message);
    }

    pub fn has_finalizer(&self) -> bool {
        has_finalizer(&self.resource)
    }

    /// Returns true when the finalizer was missing
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.resource
            .meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(K::finalizer().to_string());
        true
    }

    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.resource.meta_mut().finalizers.as_mut() {
            finalizers.retain(|f| f != K::finalizer());
        }
    }

    /// Sets the cluster-name label when absent, returns true when it did
    pub fn ensure_cluster_label(&mut self) -> bool {
        let Some(cluster) = self.cluster.as_ref().map(ResourceExt::name_any) else {
            return false;
        };
        let labels = self.resource.labels_mut();
        if labels.contains_key(CLUSTER_NAME_LABEL) {
            return false;
        }
        labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster);
        true
    }

    /// True when no owner reference points at the resolved cluster (kind, name and uid)
    pub fn should_adopt(&self) -> Result<bool> {
        let Some(cluster) = self.cluster.as_ref() else {
            return Ok(false);
        };
        let owner = owner_reference(cluster)?;
        Ok(!has_owner_ref(self.resource.owner_references(), &owner))
    }

    /// Points the owner reference of the cluster kind at the resolved cluster
    pub fn adopt(&mut self) -> Result<bool> {
        let Some(cluster) = self.cluster.as_ref() else {
            return Ok(false);
        };
        let owner = owner_reference(cluster)?;
        let refs = self
            .resource
            .meta_mut()
            .owner_references
            .get_or_insert_with(Vec::new);
        Ok(ensure_owner_ref(refs, owner))
    }

    /// Best effort, a failed event never fails the pass
    pub async fn publish(&self, ev: Event) {
        let regarding = self.resource.object_ref(&());
        if let Err(e) = self.events.publish(ev, regarding).await {
            warn!("Failed to publish event for {}: {e}", self.key());
        }
    }

    fn metadata_changed(&self) -> bool {
        let (a, b) = (self.original.meta(), self.resource.meta());
        a.finalizers != b.finalizers || a.owner_references != b.owner_references || a.labels != b.labels
    }

    fn released(&self) -> bool {
        self.is_deleting() && !self.has_finalizer()
    }

    async fn persist(&mut self) -> Result<()> {
        if self.metadata_changed() {
            let saved = self.store.replace(&self.resource).await?;
            *self.resource.meta_mut() = saved.meta().clone();
            self.original = saved;
        }
        if self.released() || self.resource.status() == self.original.status() {
            return Ok(());
        }
        match self.store.replace_status(&self.resource).await {
            Ok(saved) => {
                self.resource.meta_mut().resource_version = saved.meta().resource_version.clone();
                self.original = saved;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("{} vanished before its status could be written", self.key());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Replays this pass's changes on top of the latest stored copy.
    /// Returns false when the object no longer exists.
    async fn rebase(&mut self) -> Result<bool> {
        let Some(latest) = self.store.get(&self.namespace(), &self.name()).await? else {
            return Ok(false);
        };
        let mut rebased = latest.clone();
        let (wanted, had) = (has_finalizer(&self.resource), has_finalizer(&self.original));
        if wanted != had {
            let finalizers = rebased.meta_mut().finalizers.get_or_insert_with(Vec::new);
            finalizers.retain(|f| f != K::finalizer());
            if wanted {
                finalizers.push(K::finalizer().to_string());
            }
        }
        for owner in self.resource.owner_references() {
            if !self.original.owner_references().contains(owner) {
                ensure_owner_ref(
                    rebased.meta_mut().owner_references.get_or_insert_with(Vec::new),
                    owner.clone(),
                );
            }
        }
        for (key, value) in self.resource.labels() {
            if self.original.labels().get(key) != Some(value) {
                rebased.labels_mut().insert(key.clone(), value.clone());
            }
        }
        *rebased.status_slot() = self.resource.status().cloned();
        self.original = latest;
        self.resource = rebased;
        Ok(true)
    }

    /// Writes metadata and status changes, retrying on optimistic concurrency conflicts
    pub async fn close(&mut self) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.persist().await {
                Ok(()) => return Ok(()),
                Err(e) if is_conflict(&e) && attempts <= self.close_retries => {
                    debug!("Conflict persisting {}, retrying on a fresh copy", self.key());
                    if !self.rebase().await? {
                        return Ok(());
                    }
                }
                Err(e) if is_conflict(&e) => return Err(Error::Conflict(self.key(), attempts)),
                Err(e) => return Err(e),
            }
        }
    }
}

/// A reconcile body borrowing the scope for the duration of one pass
pub type Body<K> = for<'a> fn(&'a mut Scope<K>, &'a Context) -> BoxFuture<'a, Result<Requeue>>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Runs `body` under the reconcile deadline, then always closes the scope.
///
/// The body's error takes precedence; a close error surfaces only when the body succeeded.
pub async fn guarded<K: Declared>(mut scope: Scope<K>, ctx: &Context, body: Body<K>) -> Result<Requeue> {
    let deadline = ctx.settings.reconcile_timeout;
    let outcome = AssertUnwindSafe(tokio::time::timeout(deadline, body(&mut scope, ctx)))
        .catch_unwind()
        .await;
    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(elapsed)) => Err(Error::Elapsed(elapsed)),
        Err(payload) => Err(Error::Panicked(panic_message(payload.as_ref()))),
    };
    let closed = scope.close().await;
    match (result, closed) {
        (Ok(requeue), Ok(())) => Ok(requeue),
        (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => {
            warn!("Failed to persist {} after a failed pass: {close}", scope.key());
            Err(e)
        }
    }
}
