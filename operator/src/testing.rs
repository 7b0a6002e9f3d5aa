//! Fixtures shared by the controller tests
use crate::{
    Metrics,
    cloud::{CloudProvider, MockPowerVsClient, MockVpcClient, PowerVsClient, PowerVsTarget, VpcClient},
    config::ReconcileSettings,
    events::{EventPublisher, MockEventPublisher},
    manager::{Context, Diagnostics},
    store::memory::MemoryStore,
};
use common::{
    CONTROL_PLANE_LABEL, PowerVsCluster, PowerVsImage, VpcCluster, VpcMachine,
    powervscluster::PowerVsClusterSpec,
    powervsimage::PowerVsImageSpec,
    references::ResourceReference,
    vpccluster::{LoadBalancerReference, VpcClusterSpec, VpcClusterStatus},
    vpcmachine::{NetworkInterface, VpcMachineSpec},
};
use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{Resource, api::ObjectMeta};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tokio::sync::RwLock;

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        uid: Some(format!("uid-{name}")),
        ..ObjectMeta::default()
    }
}

fn named<K: Resource>(mut obj: K, name: &str) -> K {
    *obj.meta_mut() = meta(name);
    obj
}

pub fn settings() -> ReconcileSettings {
    ReconcileSettings::default()
}

pub fn cluster(name: &str) -> PowerVsCluster {
    named(PowerVsCluster::new(name, PowerVsClusterSpec {
        service_instance_id: "workspace-1".to_string(),
        zone: "dal10".to_string(),
        region: Some("us-south".to_string()),
    }), name)
}

pub fn image(name: &str) -> PowerVsImage {
    named(PowerVsImage::new(name, PowerVsImageSpec {
        cluster_name: "c1".to_string(),
        service_instance_id: None,
        zone: None,
        object: Some("rhcos-415.ova.gz".to_string()),
        region: Some("us-south".to_string()),
        bucket: Some("images".to_string()),
        storage_type: "tier1".to_string(),
        delete_policy: Default::default(),
    }), name)
}

pub fn vpc_cluster(name: &str) -> VpcCluster {
    let mut c = named(VpcCluster::new(name, VpcClusterSpec {
        region: "us-south".to_string(),
        resource_group: Some("rg-1".to_string()),
        vpc: Some(ResourceReference::by_id("vpc-1")),
        control_plane_endpoint: None,
    }), name);
    c.status = Some(VpcClusterStatus {
        ready: true,
        vpc_id: Some("vpc-1".to_string()),
        subnet_id: Some("subnet-1".to_string()),
        control_plane_load_balancer: Some(LoadBalancerReference {
            id: "lb-1".to_string(),
            name: None,
        }),
    });
    c
}

/// A worker machine of cluster `c1` with bootstrap data available
pub fn machine(name: &str) -> VpcMachine {
    let mut m = named(VpcMachine::new(name, VpcMachineSpec {
        name: None,
        zone: "us-south-1".to_string(),
        profile: "bx2-4x16".to_string(),
        image: ResourceReference::by_name("rhcos"),
        ssh_keys: vec![ResourceReference::by_id("key-1")],
        primary_network_interface: Some(NetworkInterface { subnet: None }),
        bootstrap_data_secret_name: Some(format!("{name}-bootstrap")),
        load_balancer_pool_members: vec![],
    }), name);
    m.metadata.labels = Some(BTreeMap::from([(
        common::CLUSTER_NAME_LABEL.to_string(),
        "c1".to_string(),
    )]));
    m
}

pub fn control_plane_machine(name: &str) -> VpcMachine {
    let mut m = machine(name);
    m.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(CONTROL_PLANE_LABEL.to_string(), "c1-control-plane".to_string());
    m
}

pub fn bootstrap_secret(name: &str) -> Secret {
    Secret {
        metadata: meta(name),
        data: Some(BTreeMap::from([(
            "value".to_string(),
            ByteString(b"#cloud-config\n".to_vec()),
        )])),
        ..Secret::default()
    }
}

/// Hands out the same mocked clients whatever the target
#[derive(Default)]
pub struct StaticProvider {
    pub vpc: Option<Arc<dyn VpcClient>>,
    pub powervs: Option<Arc<dyn PowerVsClient>>,
    /// Targets asked for, in order
    pub targets: Mutex<Vec<PowerVsTarget>>,
    pub regions: Mutex<Vec<Option<String>>>,
}

impl CloudProvider for StaticProvider {
    fn vpc(&self, region: Option<&str>) -> Arc<dyn VpcClient> {
        if let Ok(mut regions) = self.regions.lock() {
            regions.push(region.map(str::to_string));
        }
        self.vpc.clone().unwrap_or_else(|| Arc::new(MockVpcClient::new()))
    }

    fn powervs(&self, target: &PowerVsTarget) -> Arc<dyn PowerVsClient> {
        if let Ok(mut targets) = self.targets.lock() {
            targets.push(target.clone());
        }
        self.powervs.clone().unwrap_or_else(|| Arc::new(MockPowerVsClient::new()))
    }
}

pub struct ContextBuilder {
    machines: Arc<MemoryStore<VpcMachine>>,
    images: Arc<MemoryStore<PowerVsImage>>,
    vpc_clusters: Arc<MemoryStore<VpcCluster>>,
    powervs_clusters: Arc<MemoryStore<PowerVsCluster>>,
    secrets: Arc<MemoryStore<Secret>>,
    cloud: Arc<dyn CloudProvider>,
    events: Option<Arc<dyn EventPublisher>>,
    settings: ReconcileSettings,
}

/// Context over empty in-memory stores, a provider of blank mocks and
/// an event publisher accepting anything
pub fn test_context() -> ContextBuilder {
    ContextBuilder {
        machines: Arc::new(MemoryStore::default()),
        images: Arc::new(MemoryStore::default()),
        vpc_clusters: Arc::new(MemoryStore::with(vec![vpc_cluster("c1")])),
        powervs_clusters: Arc::new(MemoryStore::with(vec![cluster("c1")])),
        secrets: Arc::new(MemoryStore::default()),
        cloud: Arc::new(StaticProvider::default()),
        events: None,
        settings: settings(),
    }
}

impl ContextBuilder {
    pub fn machines(mut self, store: Arc<MemoryStore<VpcMachine>>) -> Self {
        self.machines = store;
        self
    }

    pub fn images(mut self, store: Arc<MemoryStore<PowerVsImage>>) -> Self {
        self.images = store;
        self
    }

    pub fn vpc_clusters(mut self, store: Arc<MemoryStore<VpcCluster>>) -> Self {
        self.vpc_clusters = store;
        self
    }

    pub fn powervs_clusters(mut self, store: Arc<MemoryStore<PowerVsCluster>>) -> Self {
        self.powervs_clusters = store;
        self
    }

    pub fn secrets(mut self, store: Arc<MemoryStore<Secret>>) -> Self {
        self.secrets = store;
        self
    }

    pub fn vpc(mut self, client: MockVpcClient) -> Self {
        self.cloud = Arc::new(StaticProvider {
            vpc: Some(Arc::new(client)),
            ..StaticProvider::default()
        });
        self
    }

    pub fn powervs(mut self, client: MockPowerVsClient) -> Self {
        self.cloud = Arc::new(StaticProvider {
            powervs: Some(Arc::new(client)),
            ..StaticProvider::default()
        });
        self
    }

    pub fn cloud(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.cloud = provider;
        self
    }

    pub fn events(mut self, events: MockEventPublisher) -> Self {
        self.events = Some(Arc::new(events));
        self
    }

    pub fn settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Context {
        let events = self.events.unwrap_or_else(|| {
            let mut events = MockEventPublisher::new();
            events.expect_publish().returning(|_, _| Ok(()));
            Arc::new(events)
        });
        Context {
            machines: self.machines,
            images: self.images,
            vpc_clusters: self.vpc_clusters,
            powervs_clusters: self.powervs_clusters,
            secrets: self.secrets,
            cloud: self.cloud,
            events,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Metrics::default(),
            settings: self.settings,
        }
    }
}
