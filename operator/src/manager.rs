use crate::{
    Error, Metrics, Result,
    cloud::{CloudProvider, http::HttpProvider},
    config::{Parameters, ReconcileSettings},
    events::{EventPublisher, KubeEventPublisher},
    powervsimage, vpcmachine,
    store::{KubeStore, ResourceStore},
};
use chrono::{DateTime, Utc};
use common::{PowerVsCluster, PowerVsImage, VpcCluster, VpcMachine};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{self, Controller},
        events::Reporter,
        watcher::Config,
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Context shared by every reconcile pass
#[derive(Clone)]
pub struct Context {
    pub machines: Arc<dyn ResourceStore<VpcMachine>>,
    pub images: Arc<dyn ResourceStore<PowerVsImage>>,
    pub vpc_clusters: Arc<dyn ResourceStore<VpcCluster>>,
    pub powervs_clusters: Arc<dyn ResourceStore<PowerVsCluster>>,
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    /// Hands out provider clients
    pub cloud: Arc<dyn CloudProvider>,
    pub events: Arc<dyn EventPublisher>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub settings: ReconcileSettings,
}

impl Context {
    pub async fn touch(&self) {
        self.diagnostics.write().await.last_event = Utc::now();
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "capibm-controller".into(),
        }
    }
}

/// Data owned by the Manager
#[derive(Clone, Default)]
pub struct Manager {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Metrics,
}

async fn ensure_crd<K>(api: &Api<K>) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    api.list(&ListParams::default().limit(1))
        .await
        .map(|_| ())
        .map_err(|e| Error::KubeError(e).context("is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f -"))
}

/// Manager that owns a Controller for IBMVPCMachine and IBMPowerVSImage
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` and the two controller futures.
    /// It is up to `main` to wait for the controller streams.
    pub async fn new(
        params: &Parameters,
    ) -> Result<(Self, BoxFuture<'static, ()>, BoxFuture<'static, ()>)> {
        let client = Client::try_default().await.map_err(Error::KubeError)?;
        let manager = Manager::default();
        let reporter = manager.diagnostics.read().await.reporter.clone();
        let store = Arc::new(KubeStore::new(client.clone()));
        let cloud = HttpProvider::new(
            &params.iam_endpoint,
            params.api_key.clone(),
            &params.vpc_region,
            &params.powervs_region,
        )?;
        let context = Arc::new(Context {
            machines: store.clone(),
            images: store.clone(),
            vpc_clusters: store.clone(),
            powervs_clusters: store.clone(),
            secrets: store,
            cloud: Arc::new(cloud),
            events: Arc::new(KubeEventPublisher::new(client.clone(), reporter)),
            diagnostics: manager.diagnostics.clone(),
            metrics: manager.metrics.clone(),
            settings: ReconcileSettings::from(params),
        });

        let machines = Api::<VpcMachine>::all(client.clone());
        let images = Api::<PowerVsImage>::all(client);
        // Ensure CRD is installed before loop-watching
        ensure_crd(&machines).await?;
        ensure_crd(&images).await?;

        let config = controller::Config::default().concurrency(params.concurrency);
        let controller_machines = Controller::new(machines, Config::default().any_semantic())
            .with_config(config.clone())
            .shutdown_on_signal()
            .run(vpcmachine::reconcile, vpcmachine::error_policy, context.clone())
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        let controller_images = Controller::new(images, Config::default().any_semantic())
            .with_config(config)
            .shutdown_on_signal()
            .run(powervsimage::reconcile, powervsimage::error_policy, context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        Ok((manager, controller_machines, controller_images))
    }

    /// Metrics getter
    #[must_use]
    pub fn metrics(&self) -> String {
        self.metrics.encode().unwrap_or_default()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
