use crate::{
    Error, Requeue, Result,
    cloud::{CloudProvider, ImageImportRequest, PowerVsClient, PowerVsTarget},
    events,
    manager::Context,
    scope::{Declared, Scope, guarded},
    store::ResourceStore,
};
use common::{
    ConditionSeverity, HasConditions, ImageState, JobState, PowerVsCluster, PowerVsImage,
    powervsimage::{
        DeletePolicy, IMAGE_FINALIZER, IMAGE_IMPORT_FAILED_REASON, IMAGE_IMPORTED_CONDITION,
        IMAGE_NOT_READY_REASON, IMAGE_READY_CONDITION, PowerVsImageStatus, PowerVsWorkspace,
    },
};
use futures::{FutureExt, future::BoxFuture};
use kube::{ResourceExt, runtime::controller::Action};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

impl Declared for PowerVsImage {
    type Status = PowerVsImageStatus;
    type Cluster = PowerVsCluster;
    type Cloud = dyn PowerVsClient;

    fn finalizer() -> &'static str {
        IMAGE_FINALIZER
    }

    fn cluster_name(&self) -> Option<String> {
        Some(self.spec.cluster_name.clone())
    }

    fn status(&self) -> Option<&PowerVsImageStatus> {
        self.status.as_ref()
    }

    fn status_slot(&mut self) -> &mut Option<PowerVsImageStatus> {
        &mut self.status
    }

    fn connect(&self, cluster: Option<&PowerVsCluster>, provider: &dyn CloudProvider) -> Arc<dyn PowerVsClient> {
        provider.powervs(&target(self, cluster))
    }

    fn stores(ctx: &Context) -> (Arc<dyn ResourceStore<Self>>, Arc<dyn ResourceStore<PowerVsCluster>>) {
        (ctx.images.clone(), ctx.powervs_clusters.clone())
    }
}

/// Workspace the image lives in: the one recorded at import time, then its
/// own settings, then the cluster's
fn target(image: &PowerVsImage, cluster: Option<&PowerVsCluster>) -> PowerVsTarget {
    if let Some(recorded) = image.status.as_ref().and_then(|s| s.workspace.as_ref()) {
        return PowerVsTarget {
            service_instance_id: Some(recorded.service_instance_id.clone()),
            zone: recorded.zone.clone(),
            region: recorded.region.clone(),
        };
    }
    PowerVsTarget {
        service_instance_id: image
            .spec
            .service_instance_id
            .clone()
            .or_else(|| cluster.map(|c| c.spec.service_instance_id.clone()))
            .filter(|id| !id.is_empty()),
        zone: image
            .spec
            .zone
            .clone()
            .or_else(|| cluster.map(|c| c.spec.zone.clone())),
        region: cluster.and_then(|c| c.spec.region.clone()),
    }
}

/// Keeps the workspace around so teardown does not depend on the cluster
fn record_workspace(scope: &mut Scope<PowerVsImage>) {
    if scope.resource().status.as_ref().is_some_and(|s| s.workspace.is_some()) {
        return;
    }
    let target = target(scope.resource(), scope.cluster());
    if let Some(service_instance_id) = target.service_instance_id {
        scope.status_mut().workspace = Some(PowerVsWorkspace {
            service_instance_id,
            zone: target.zone,
            region: target.region,
        });
    }
}

fn import_request(image: &PowerVsImage) -> Result<ImageImportRequest> {
    let missing = |field| {
        Error::from(common::Error::MissingField {
            kind: "IBMPowerVSImage".to_string(),
            name: image.name_any(),
            field,
        })
    };
    Ok(ImageImportRequest {
        image_name: image.name_any(),
        bucket: image.spec.bucket.clone().ok_or_else(|| missing("bucket"))?,
        object: image.spec.object.clone().ok_or_else(|| missing("object"))?,
        region: image.spec.region.clone().ok_or_else(|| missing("region"))?,
        storage_type: image.spec.storage_type.clone(),
    })
}

#[instrument(skip(ctx, image), fields(name = %image.name_any()))]
pub async fn reconcile(image: Arc<PowerVsImage>, ctx: Arc<Context>) -> Result<Action> {
    let _mes = ctx.metrics.image.count_and_measure();
    ctx.touch().await;
    let namespace = image.namespace().unwrap_or_default();
    // the cached copy may be stale, always work on the stored one
    let Some(latest) = ctx.images.get(&namespace, &image.name_any()).await? else {
        debug!("IBMPowerVSImage {namespace}/{} is gone", image.name_any());
        return Ok(Action::await_change());
    };
    let scope = Scope::new(latest, &ctx).await?;
    let requeue = if scope.is_deleting() {
        guarded(scope, &ctx, delete_body).await?
    } else {
        guarded(scope, &ctx, normal_body).await?
    };
    Ok(requeue.into())
}

#[must_use]
pub fn error_policy(image: Arc<PowerVsImage>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed for IBMPowerVSImage {:?}: {error}", image.metadata.name);
    ctx.metrics
        .image
        .reconcile_failure(&format!("{}/{}", image.namespace().unwrap_or_default(), image.name_any()), error);
    Action::requeue(error.requeue_after().unwrap_or(ctx.settings.error_backoff))
}

fn normal_body<'a>(scope: &'a mut Scope<PowerVsImage>, ctx: &'a Context) -> BoxFuture<'a, Result<Requeue>> {
    reconcile_normal(scope, ctx).boxed()
}

fn delete_body<'a>(scope: &'a mut Scope<PowerVsImage>, ctx: &'a Context) -> BoxFuture<'a, Result<Requeue>> {
    reconcile_delete(scope, ctx).boxed()
}

pub async fn reconcile_normal(scope: &mut Scope<PowerVsImage>, ctx: &Context) -> Result<Requeue> {
    if scope.add_finalizer() {
        return Ok(Requeue::Immediate);
    }
    scope.ensure_cluster_label();
    if scope.should_adopt()? {
        scope.adopt()?;
        info!("Adopted IBMPowerVSImage {} into its cluster", scope.key());
        return Ok(Requeue::Immediate);
    }
    record_workspace(scope);

    if let Some(requeue) = reconcile_job(scope, ctx).await? {
        return Ok(requeue);
    }

    match get_or_create(scope).await? {
        Some(image_id) => reconcile_image(scope, ctx, &image_id).await,
        None => Ok(Requeue::After(ctx.settings.job_poll)),
    }
}

/// Follows the recorded import job. `None` means there is none or it
/// completed, so the image can be looked up.
pub async fn reconcile_job(scope: &mut Scope<PowerVsImage>, ctx: &Context) -> Result<Option<Requeue>> {
    let Some(job_id) = scope.resource().job_id().map(str::to_string) else {
        return Ok(None);
    };
    let poll = ctx.settings.job_poll;
    let job = scope
        .cloud()
        .get_job(&job_id)
        .await
        .map_err(|e| Error::from(e).context(format!("getting import job {job_id}")).with_requeue(poll))?;
    debug!("Import job {job_id} of {} is {}", scope.key(), job.state);

    let status = scope.status_mut();
    match &job.state {
        JobState::Completed => {
            status.mark_true(IMAGE_IMPORTED_CONDITION);
            Ok(None)
        }
        JobState::Failed => {
            status.ready = false;
            status.image_state = Some(ImageState::Failed);
            status.mark_false(
                IMAGE_IMPORTED_CONDITION,
                IMAGE_IMPORT_FAILED_REASON,
                ConditionSeverity::Error,
                &job.message,
            );
            Err(Error::ImportFailed(job.message.clone()).with_requeue(poll))
        }
        JobState::Queued => {
            status.ready = false;
            status.image_state = Some(ImageState::Queued);
            status.mark_false(IMAGE_IMPORTED_CONDITION, "queued", ConditionSeverity::Info, &job.message);
            Ok(Some(Requeue::After(poll)))
        }
        JobState::Importing(raw) | JobState::Unknown(raw) => {
            status.ready = false;
            status.image_state = Some(ImageState::Importing);
            status.mark_false(IMAGE_IMPORTED_CONDITION, raw, ConditionSeverity::Info, &job.message);
            Ok(Some(Requeue::After(poll)))
        }
    }
}

/// Finds the image by name or starts importing it. Never starts a second job
/// while one is recorded.
pub async fn get_or_create(scope: &mut Scope<PowerVsImage>) -> Result<Option<String>> {
    let cloud = scope.cloud();
    let name = scope.name();
    let existing = cloud
        .get_all_images()
        .await
        .map_err(|e| Error::from(e).context("listing images"))?
        .into_iter()
        .find(|i| i.name == name);
    if let Some(image) = existing {
        debug!("Image {name} already exists as {}", image.id);
        return Ok(Some(image.id));
    }
    if let Some(job_id) = scope.resource().job_id() {
        debug!("Waiting on import job {job_id} for {}", scope.key());
        return Ok(None);
    }
    let request = import_request(scope.resource())?;
    let job_id = cloud
        .create_image_import_job(&request)
        .await
        .map_err(|e| Error::from(e).context(format!("importing {}/{}", request.bucket, request.object)))?;
    info!("Started import job {job_id} for {}", scope.key());
    let status = scope.status_mut();
    status.job_id = Some(job_id);
    status.mark_false(IMAGE_IMPORTED_CONDITION, "queued", ConditionSeverity::Info, "");
    Ok(None)
}

pub async fn reconcile_image(scope: &mut Scope<PowerVsImage>, ctx: &Context, image_id: &str) -> Result<Requeue> {
    let image = scope
        .cloud()
        .get_image(image_id)
        .await
        .map_err(|e| Error::from(e).context(format!("getting image {image_id}")))?;
    let status = scope.status_mut();
    status.image_id = Some(image.id.clone());
    status.image_state = Some(image.state.clone());
    status.job_id = None;
    match image.state {
        ImageState::Queued => {
            status.ready = false;
            status.mark_false(
                IMAGE_READY_CONDITION,
                IMAGE_NOT_READY_REASON,
                ConditionSeverity::Warning,
                "",
            );
            Ok(Requeue::After(ctx.settings.image_poll))
        }
        ImageState::Active => {
            status.ready = true;
            status.mark_true(IMAGE_READY_CONDITION);
            Ok(Requeue::None)
        }
        other => {
            status.ready = false;
            status.mark_unknown(IMAGE_READY_CONDITION, IMAGE_NOT_READY_REASON, &format!("image is {other}"));
            Ok(Requeue::After(ctx.settings.image_poll))
        }
    }
}

pub async fn reconcile_delete(scope: &mut Scope<PowerVsImage>, _ctx: &Context) -> Result<Requeue> {
    if !scope.has_finalizer() {
        return Ok(Requeue::None);
    }
    let image = scope.resource();
    let retained = image.spec.delete_policy == DeletePolicy::Retain;
    let owns_cloud_state = image.image_id().map_or(image.job_id().is_some(), |_| !retained);
    if owns_cloud_state && target(image, scope.cluster()).service_instance_id.is_none() {
        return Err(Error::UnknownTarget(scope.key()));
    }
    let cloud = scope.cloud();
    match scope.resource().image_id().map(str::to_string) {
        None => {
            if let Some(job_id) = scope.resource().job_id() {
                match cloud.delete_job(job_id).await {
                    Ok(()) => info!("Deleted import job {job_id} of {}", scope.key()),
                    Err(e) if e.is_not_found() => debug!("Import job {job_id} already gone"),
                    Err(e) => return Err(Error::from(e).context(format!("deleting import job {job_id}"))),
                }
            }
        }
        Some(_) if retained => {
            info!("Retaining image of {} as asked", scope.key());
        }
        Some(image_id) => match cloud.delete_image(&image_id).await {
            Ok(()) => info!("Deleted image {image_id} of {}", scope.key()),
            Err(e) if e.is_not_found() => debug!("Image {image_id} already gone"),
            Err(e) => return Err(Error::from(e).context(format!("deleting image {image_id}"))),
        },
    }
    scope.remove_finalizer();
    scope
        .publish(events::finalizer_removed("IBMPowerVSImage", &scope.name()))
        .await;
    Ok(Requeue::None)
}
