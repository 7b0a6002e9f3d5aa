use crate::{
    Error, Requeue, Result,
    cloud::{CloudProvider, Instance, InstancePrototype, VpcClient},
    events, loadbalancer,
    manager::Context,
    scope::{Declared, Scope, guarded},
    store::ResourceStore,
};
use common::{
    CLUSTER_NAME_LABEL, ConditionSeverity, HasConditions, InstanceStatus, VpcCluster, VpcMachine,
    vpcmachine::{
        AddressType, INSTANCE_ERRORED_REASON, INSTANCE_NOT_READY_REASON, INSTANCE_READY_CONDITION,
        INSTANCE_STATE_UNKNOWN_REASON, INSTANCE_STOPPED_REASON, MACHINE_FINALIZER, MachineAddress,
        UPDATE_MACHINE_ERROR, VpcMachineStatus,
    },
};
use futures::{FutureExt, future::BoxFuture};
use kube::{ResourceExt, runtime::controller::Action};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

static BOOTSTRAP_DATA_KEY: &str = "value";

impl Declared for VpcMachine {
    type Status = VpcMachineStatus;
    type Cluster = VpcCluster;
    type Cloud = dyn VpcClient;

    fn finalizer() -> &'static str {
        MACHINE_FINALIZER
    }

    fn cluster_name(&self) -> Option<String> {
        self.labels().get(CLUSTER_NAME_LABEL).cloned()
    }

    fn status(&self) -> Option<&VpcMachineStatus> {
        self.status.as_ref()
    }

    fn status_slot(&mut self) -> &mut Option<VpcMachineStatus> {
        &mut self.status
    }

    /// The region recorded at creation wins over the cluster's current one
    fn connect(&self, cluster: Option<&VpcCluster>, provider: &dyn CloudProvider) -> Arc<dyn VpcClient> {
        provider.vpc(self.region().or(cluster.map(|c| c.spec.region.as_str())))
    }

    fn stores(ctx: &Context) -> (Arc<dyn ResourceStore<Self>>, Arc<dyn ResourceStore<VpcCluster>>) {
        (ctx.machines.clone(), ctx.vpc_clusters.clone())
    }
}

fn provider_id(cluster: &str, instance_id: &str) -> String {
    format!("ibmvpc://{cluster}/{instance_id}")
}

#[instrument(skip(ctx, machine), fields(name = %machine.name_any()))]
pub async fn reconcile(machine: Arc<VpcMachine>, ctx: Arc<Context>) -> Result<Action> {
    let _mes = ctx.metrics.machine.count_and_measure();
    ctx.touch().await;
    let namespace = machine.namespace().unwrap_or_default();
    let Some(latest) = ctx.machines.get(&namespace, &machine.name_any()).await? else {
        debug!("IBMVPCMachine {namespace}/{} is gone", machine.name_any());
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
pub fn error_policy(machine: Arc<VpcMachine>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed for IBMVPCMachine {:?}: {error}", machine.metadata.name);
    ctx.metrics.machine.reconcile_failure(
        &format!("{}/{}", machine.namespace().unwrap_or_default(), machine.name_any()),
        error,
    );
    Action::requeue(error.requeue_after().unwrap_or(ctx.settings.error_backoff))
}

fn normal_body<'a>(scope: &'a mut Scope<VpcMachine>, ctx: &'a Context) -> BoxFuture<'a, Result<Requeue>> {
    reconcile_normal(scope, ctx).boxed()
}

fn delete_body<'a>(scope: &'a mut Scope<VpcMachine>, ctx: &'a Context) -> BoxFuture<'a, Result<Requeue>> {
    reconcile_delete(scope, ctx).boxed()
}

pub async fn reconcile_normal(scope: &mut Scope<VpcMachine>, ctx: &Context) -> Result<Requeue> {
    record_region(scope);
    if scope.add_finalizer() {
        return Ok(Requeue::Immediate);
    }
    scope.ensure_cluster_label();
    if scope.should_adopt()? {
        scope.adopt()?;
        info!("Adopted IBMVPCMachine {} into its cluster", scope.key());
        return Ok(Requeue::Immediate);
    }
    let poll = ctx.settings.instance_poll;
    if scope.resource().spec.bootstrap_data_secret_name.is_none() {
        debug!("Bootstrap data of {} is not available yet", scope.key());
        return Ok(Requeue::After(poll));
    }

    let Some(instance) = get_or_create(scope, ctx).await? else {
        let status = scope.status_mut();
        status.ready = false;
        status.mark_unknown(
            INSTANCE_READY_CONDITION,
            INSTANCE_STATE_UNKNOWN_REASON,
            "instance does not exist yet",
        );
        return Ok(Requeue::After(poll));
    };
    record_instance(scope, &instance).await?;

    match &instance.status {
        InstanceStatus::Pending => {
            scope.status_mut().ready = false;
            scope.mark_false(INSTANCE_READY_CONDITION, INSTANCE_NOT_READY_REASON, ConditionSeverity::Warning, "");
            Ok(Requeue::After(poll))
        }
        InstanceStatus::Stopped => {
            scope.status_mut().ready = false;
            scope.mark_false(INSTANCE_READY_CONDITION, INSTANCE_STOPPED_REASON, ConditionSeverity::Error, "");
            Ok(Requeue::After(poll))
        }
        InstanceStatus::Failed => {
            let message = instance
                .health_reasons
                .last()
                .map(|r| format!("{}: {}", r.code, r.message))
                .unwrap_or_default();
            let status = scope.status_mut();
            status.ready = false;
            status.failure_reason = Some(UPDATE_MACHINE_ERROR.to_string());
            status.failure_message = Some(message.clone());
            status.mark_false(
                INSTANCE_READY_CONDITION,
                INSTANCE_ERRORED_REASON,
                ConditionSeverity::Error,
                &message,
            );
            warn!("Instance {} of {} failed: {message}", instance.id, scope.key());
            scope.publish(events::failed_build_instance(&message)).await;
            Ok(Requeue::None)
        }
        InstanceStatus::Running => reconcile_running(scope, ctx, &instance).await,
        InstanceStatus::Unknown(raw) => {
            scope.status_mut().ready = false;
            scope.mark_unknown(
                INSTANCE_READY_CONDITION,
                INSTANCE_STATE_UNKNOWN_REASON,
                &format!("instance is {raw}"),
            );
            Ok(Requeue::After(poll))
        }
    }
}

async fn bootstrap_data(scope: &Scope<VpcMachine>, ctx: &Context) -> Result<String> {
    let name = scope
        .resource()
        .spec
        .bootstrap_data_secret_name
        .clone()
        .unwrap_or_default();
    let secret = ctx
        .secrets
        .get(&scope.namespace(), &name)
        .await?
        .ok_or_else(|| Error::MissingBootstrapData(name.clone()))?;
    let value = secret
        .data
        .as_ref()
        .and_then(|d| d.get(BOOTSTRAP_DATA_KEY))
        .ok_or_else(|| Error::MissingBootstrapData(name.clone()))?;
    String::from_utf8(value.0.clone()).map_err(|_| Error::MissingBootstrapData(name))
}

/// Finds the instance by recorded id, then by name, and creates it otherwise.
/// Creation waits while no subnet is known.
pub async fn get_or_create(scope: &Scope<VpcMachine>, ctx: &Context) -> Result<Option<Instance>> {
    let cloud = scope.cloud();
    let machine = scope.resource();
    if let Some(id) = machine.instance_id() {
        if let Some(found) = cloud.get_instance(id).await? {
            return Ok(Some(found));
        }
        debug!("Recorded instance {id} of {} no longer exists", scope.key());
    }
    let name = machine.instance_name();
    if let Some(found) = cloud.get_instance_by_name(&name).await? {
        return Ok(Some(found));
    }

    let Some(cluster) = scope.cluster() else {
        return Ok(None);
    };
    let subnet = cluster.subnet_id().map(str::to_string).or_else(|| {
        machine
            .spec
            .primary_network_interface
            .as_ref()
            .and_then(|n| n.subnet.clone())
    });
    let Some(subnet) = subnet else {
        info!("No subnet known for {} yet, deferring creation", scope.key());
        return Ok(None);
    };
    let prototype = InstancePrototype {
        name,
        zone: machine.spec.zone.clone(),
        profile: machine.spec.profile.clone(),
        vpc: cluster.vpc_id().map(str::to_string),
        subnet,
        image_id: machine.spec.image.id.clone(),
        image_name: machine.spec.image.name.clone(),
        ssh_keys: machine
            .spec
            .ssh_keys
            .iter()
            .filter_map(|k| k.id.clone().or_else(|| k.name.clone()))
            .collect(),
        resource_group: cluster.spec.resource_group.clone(),
        user_data: Some(bootstrap_data(scope, ctx).await?),
    };
    let created = cloud
        .create_instance(&prototype)
        .await
        .map_err(|e| Error::from(e).context(format!("creating instance {}", prototype.name)))?;
    info!("Created instance {} for {}", created.id, scope.key());
    Ok(Some(created))
}

/// Tags the instance and sets the provider id the first time it is seen,
/// then refreshes what the provider reports
async fn record_instance(scope: &mut Scope<VpcMachine>, instance: &Instance) -> Result<()> {
    let known = scope
        .status()
        .and_then(|s| s.provider_id.as_deref())
        .is_some_and(|p| !p.is_empty());
    if !known {
        let cluster = scope
            .cluster()
            .map(ResourceExt::name_any)
            .unwrap_or_default();
        if let Some(crn) = instance.crn.as_deref() {
            scope
                .cloud()
                .tag_resource(&cluster, crn)
                .await
                .map_err(|e| Error::from(e).context(format!("tagging instance {}", instance.id)))?;
        }
        scope.status_mut().provider_id = Some(provider_id(&cluster, &instance.id));
    }
    let status = scope.status_mut();
    status.instance_id = Some(instance.id.clone());
    status.instance_status = Some(instance.status.clone());
    status.addresses = instance
        .primary_ip
        .iter()
        .map(|ip| MachineAddress {
            type_: AddressType::InternalIP,
            address: ip.clone(),
        })
        .collect();
    Ok(())
}

/// Pins the VPC region so teardown still knows it once the cluster is gone
fn record_region(scope: &mut Scope<VpcMachine>) {
    if scope.resource().region().is_some() {
        return;
    }
    if let Some(region) = scope.cluster().map(|c| c.spec.region.clone()) {
        scope.status_mut().region = Some(region);
    }
}

async fn reconcile_running(scope: &mut Scope<VpcMachine>, ctx: &Context, instance: &Instance) -> Result<Requeue> {
    let cloud = scope.cloud();
    let machine = scope.resource();
    let members = &machine.spec.load_balancer_pool_members;
    let needs_requeue = if !members.is_empty() {
        let address = loadbalancer::usable_address(instance.primary_ip.as_deref())?;
        loadbalancer::reconcile_members(cloud.as_ref(), members, address).await?
    } else if machine.is_control_plane() {
        let Some(cluster) = scope.cluster() else {
            return Ok(Requeue::After(ctx.settings.instance_poll));
        };
        loadbalancer::reconcile_control_plane_member(cloud.as_ref(), cluster, instance.primary_ip.as_deref()).await?
    } else {
        false
    };
    if needs_requeue {
        debug!("Pool membership of {} is not active yet", scope.key());
        scope.status_mut().ready = false;
        scope.mark_false(
            INSTANCE_READY_CONDITION,
            INSTANCE_NOT_READY_REASON,
            ConditionSeverity::Info,
            "waiting for load balancer pool membership",
        );
        return Ok(Requeue::After(ctx.settings.instance_poll));
    }
    let status = scope.status_mut();
    status.ready = true;
    status.failure_reason = None;
    status.failure_message = None;
    status.mark_true(INSTANCE_READY_CONDITION);
    Ok(Requeue::None)
}

pub async fn reconcile_delete(scope: &mut Scope<VpcMachine>, _ctx: &Context) -> Result<Requeue> {
    if !scope.has_finalizer() {
        return Ok(Requeue::None);
    }
    if scope.resource().region().is_none() && scope.cluster().is_none() {
        return Err(Error::UnknownTarget(scope.key()));
    }
    let cloud = scope.cloud();
    let machine = scope.resource();

    if let Some(address) = machine.internal_address() {
        let members = &machine.spec.load_balancer_pool_members;
        if !members.is_empty() {
            loadbalancer::deregister_members(cloud.as_ref(), members, address).await?;
        } else if machine.is_control_plane() {
            match scope.cluster() {
                Some(cluster) => loadbalancer::deregister_control_plane_member(cloud.as_ref(), cluster, address).await?,
                None => debug!("Cluster of {} is gone, no pool to leave", scope.key()),
            }
        }
    }

    let instance_id = match machine.instance_id() {
        Some(id) => Some(id.to_string()),
        None => cloud
            .get_instance_by_name(&machine.instance_name())
            .await?
            .map(|i| i.id),
    };
    if let Some(id) = instance_id {
        match cloud.delete_instance(&id).await {
            Ok(()) => info!("Deleted instance {id} of {}", scope.key()),
            Err(e) if e.is_not_found() => debug!("Instance {id} already gone"),
            Err(e) => return Err(Error::from(e).context(format!("deleting instance {id}"))),
        }
    }

    scope.remove_finalizer();
    scope
        .publish(events::finalizer_removed("IBMVPCMachine", &scope.name()))
        .await;
    Ok(Requeue::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cloud::{CloudError, HealthReason, LoadBalancer, MockVpcClient, PoolRef, ProvisioningStatus},
        events::MockEventPublisher,
        store::memory::MemoryStore,
        testing::{StaticProvider, bootstrap_secret, control_plane_machine, machine, test_context, vpc_cluster},
    };
    use common::ConditionStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::runtime::events::EventType;
    use mockall::predicate::eq;
    use std::time::Duration;

    fn instance(status: InstanceStatus, ip: Option<&str>) -> Instance {
        Instance {
            id: "0717_i1".into(),
            name: "m1".into(),
            crn: Some("crn:v1:instance:0717_i1".into()),
            status,
            primary_ip: ip.map(str::to_string),
            health_reasons: vec![],
        }
    }

    /// A machine that already went through finalizer and adoption passes
    fn owned(mut m: VpcMachine) -> VpcMachine {
        m.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        let cluster = vpc_cluster("c1");
        m.metadata.owner_references = Some(vec![common::references::owner_reference(&cluster).unwrap()]);
        m
    }

    fn with_instance(mut m: VpcMachine, ip: &str) -> VpcMachine {
        m.status = Some(VpcMachineStatus {
            instance_id: Some("0717_i1".into()),
            provider_id: Some("ibmvpc://c1/0717_i1".into()),
            addresses: vec![MachineAddress {
                type_: AddressType::InternalIP,
                address: ip.into(),
            }],
            ..Default::default()
        });
        m
    }

    fn deleting(mut m: VpcMachine) -> VpcMachine {
        m.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        m
    }

    async fn pass(store: &Arc<MemoryStore<VpcMachine>>, ctx: &Arc<Context>, name: &str) -> Result<Action> {
        let current = store.current("default", name).expect("machine exists");
        reconcile(Arc::new(current), ctx.clone()).await
    }

    #[tokio::test]
    async fn test_creates_tags_and_becomes_ready() {
        let store = Arc::new(MemoryStore::with(vec![machine("m1")]));
        let secrets = Arc::new(MemoryStore::with(vec![bootstrap_secret("m1-bootstrap")]));
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_instance_by_name().with(eq("m1")).times(1).returning(|_| Ok(None));
        vpc.expect_create_instance()
            .withf(|p| {
                p.subnet == "subnet-1"
                    && p.vpc.as_deref() == Some("vpc-1")
                    && p.image_name.as_deref() == Some("rhcos")
                    && p.ssh_keys == vec!["key-1".to_string()]
                    && p.user_data.as_deref() == Some("#cloud-config\n")
            })
            .times(1)
            .returning(|_| Ok(instance(InstanceStatus::Pending, None)));
        vpc.expect_tag_resource()
            .with(eq("c1"), eq("crn:v1:instance:0717_i1"))
            .times(1)
            .returning(|_, _| Ok(()));
        vpc.expect_get_instance()
            .with(eq("0717_i1"))
            .times(1)
            .returning(|_| Ok(Some(instance(InstanceStatus::Running, Some("10.0.0.5")))));
        let ctx = Arc::new(
            test_context()
                .machines(store.clone())
                .secrets(secrets)
                .vpc(vpc)
                .build(),
        );

        // finalizer, then adoption
        pass(&store, &ctx, "m1").await.unwrap();
        pass(&store, &ctx, "m1").await.unwrap();

        assert_eq!(
            pass(&store, &ctx, "m1").await.unwrap(),
            Action::requeue(Duration::from_secs(60))
        );
        let pending = store.current("default", "m1").unwrap().status.unwrap();
        assert_eq!(pending.provider_id.as_deref(), Some("ibmvpc://c1/0717_i1"));
        let cond = pending.get_condition(INSTANCE_READY_CONDITION).unwrap();
        assert_eq!(cond.severity, Some(ConditionSeverity::Warning));
        assert!(!pending.ready);

        assert_eq!(pass(&store, &ctx, "m1").await.unwrap(), Action::await_change());
        let running = store.current("default", "m1").unwrap().status.unwrap();
        assert!(running.ready);
        assert!(running.is_condition_true(INSTANCE_READY_CONDITION));
        assert_eq!(running.addresses[0].address, "10.0.0.5");
        assert_eq!(running.instance_status, Some(InstanceStatus::Running));
    }

    #[tokio::test]
    async fn test_waits_for_bootstrap_data() {
        let mut m = owned(machine("m1"));
        m.spec.bootstrap_data_secret_name = None;
        let store = Arc::new(MemoryStore::with(vec![m]));
        let ctx = Arc::new(test_context().machines(store.clone()).vpc(MockVpcClient::new()).build());
        assert_eq!(
            pass(&store, &ctx, "m1").await.unwrap(),
            Action::requeue(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn test_missing_secret_is_an_error() {
        let store = Arc::new(MemoryStore::with(vec![owned(machine("m1"))]));
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_instance_by_name().returning(|_| Ok(None));
        vpc.expect_create_instance().never();
        let ctx = Arc::new(test_context().machines(store.clone()).vpc(vpc).build());
        let err = pass(&store, &ctx, "m1").await.unwrap_err();
        assert!(matches!(err, Error::MissingBootstrapData(_)));
    }

    #[tokio::test]
    async fn test_no_subnet_defers_creation() {
        let mut cluster = vpc_cluster("c1");
        if let Some(s) = cluster.status.as_mut() {
            s.subnet_id = None;
        }
        let store = Arc::new(MemoryStore::with(vec![owned(machine("m1"))]));
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_instance_by_name().returning(|_| Ok(None));
        vpc.expect_create_instance().never();
        let ctx = Arc::new(
            test_context()
                .machines(store.clone())
                .vpc_clusters(Arc::new(MemoryStore::with(vec![cluster])))
                .vpc(vpc)
                .build(),
        );
        assert_eq!(
            pass(&store, &ctx, "m1").await.unwrap(),
            Action::requeue(Duration::from_secs(60))
        );
        let status = store.current("default", "m1").unwrap().status.unwrap();
        let cond = status.get_condition(INSTANCE_READY_CONDITION).unwrap();
        assert_eq!(cond.status, ConditionStatus::Unknown);
        assert_eq!(cond.reason.as_deref(), Some(INSTANCE_STATE_UNKNOWN_REASON));
    }

    #[tokio::test]
    async fn test_failed_instance_reports_once() {
        let store = Arc::new(MemoryStore::with(vec![with_instance(owned(machine("m1")), "10.0.0.5")]));
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_instance().returning(|_| {
            let mut i = instance(InstanceStatus::Failed, Some("10.0.0.5"));
            i.health_reasons = vec![
                HealthReason {
                    code: "E0".into(),
                    message: "older".into(),
                },
                HealthReason {
                    code: "E1".into(),
                    message: "quota exceeded".into(),
                },
            ];
            Ok(Some(i))
        });
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|ev, _| {
                ev.type_ == EventType::Warning
                    && ev.reason == "FailedBuildInstance"
                    && ev.note.as_deref() == Some("Failed to build the instance - E1: quota exceeded")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = Arc::new(test_context().machines(store.clone()).vpc(vpc).events(events).build());

        assert_eq!(pass(&store, &ctx, "m1").await.unwrap(), Action::await_change());
        let status = store.current("default", "m1").unwrap().status.unwrap();
        assert_eq!(status.failure_message.as_deref(), Some("E1: quota exceeded"));
        assert_eq!(status.failure_reason.as_deref(), Some(UPDATE_MACHINE_ERROR));
        let cond = status.get_condition(INSTANCE_READY_CONDITION).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.severity, Some(ConditionSeverity::Error));
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn test_control_plane_without_address_fails() {
        let m = with_instance(owned(control_plane_machine("cp-0")), "0.0.0.0");
        let store = Arc::new(MemoryStore::with(vec![m]));
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_instance()
            .returning(|_| Ok(Some(instance(InstanceStatus::Running, Some("0.0.0.0")))));
        vpc.expect_create_load_balancer_pool_member().never();
        let ctx = Arc::new(test_context().machines(store.clone()).vpc(vpc).build());

        let err = pass(&store, &ctx, "cp-0").await.unwrap_err();
        assert_eq!(err.to_string(), "invalid primary ip address");
        let status = store.current("default", "cp-0").unwrap().status.unwrap();
        assert!(!status.ready);
        assert!(!status.is_condition_true(INSTANCE_READY_CONDITION));
    }

    #[tokio::test]
    async fn test_control_plane_waits_for_membership() {
        let m = with_instance(owned(control_plane_machine("cp-0")), "10.0.0.7");
        let store = Arc::new(MemoryStore::with(vec![m]));
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_instance()
            .returning(|_| Ok(Some(instance(InstanceStatus::Running, Some("10.0.0.7")))));
        vpc.expect_get_load_balancer().returning(|id| {
            Ok(Some(LoadBalancer {
                id: id.to_string(),
                name: "api".into(),
                provisioning_status: ProvisioningStatus::Active,
                pools: vec![PoolRef {
                    id: "pool-1".into(),
                    name: "apiserver".into(),
                }],
            }))
        });
        vpc.expect_list_load_balancer_pool_members().returning(|_, _| Ok(vec![]));
        vpc.expect_create_load_balancer_pool_member()
            .times(1)
            .returning(|_, _, address, port, _| {
                Ok(crate::cloud::PoolMember {
                    id: "m-1".into(),
                    address: Some(address.to_string()),
                    port,
                    provisioning_status: ProvisioningStatus::CreatePending,
                })
            });
        let ctx = Arc::new(test_context().machines(store.clone()).vpc(vpc).build());

        assert_eq!(
            pass(&store, &ctx, "cp-0").await.unwrap(),
            Action::requeue(Duration::from_secs(60))
        );
        assert!(!store.current("default", "cp-0").unwrap().status.unwrap().ready);
    }

    #[tokio::test]
    async fn test_delete_deregisters_then_deletes() {
        let m = deleting(with_instance(owned(control_plane_machine("cp-0")), "10.0.0.7"));
        let store = Arc::new(MemoryStore::with(vec![m]));
        let mut vpc = MockVpcClient::new();
        let mut seq = mockall::Sequence::new();
        vpc.expect_get_load_balancer().returning(|id| {
            Ok(Some(LoadBalancer {
                id: id.to_string(),
                name: "api".into(),
                provisioning_status: ProvisioningStatus::Active,
                pools: vec![PoolRef {
                    id: "pool-1".into(),
                    name: "apiserver".into(),
                }],
            }))
        });
        vpc.expect_list_load_balancer_pool_members().returning(|_, _| {
            Ok(vec![crate::cloud::PoolMember {
                id: "m-1".into(),
                address: Some("10.0.0.7".into()),
                port: 6443,
                provisioning_status: ProvisioningStatus::Active,
            }])
        });
        vpc.expect_delete_load_balancer_pool_member()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        vpc.expect_delete_instance()
            .with(eq("0717_i1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Err(CloudError::NotFound(id.to_string())));
        let ctx = Arc::new(test_context().machines(store.clone()).vpc(vpc).build());

        assert_eq!(pass(&store, &ctx, "cp-0").await.unwrap(), Action::await_change());
        assert!(store.current("default", "cp-0").is_none());
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_finalizer() {
        let m = deleting(with_instance(owned(machine("m1")), "10.0.0.5"));
        let store = Arc::new(MemoryStore::with(vec![m]));
        let mut vpc = MockVpcClient::new();
        vpc.expect_delete_instance()
            .returning(|_| Err(CloudError::Unexpected("instance is busy".into())));
        let ctx = Arc::new(test_context().machines(store.clone()).vpc(vpc).build());

        assert!(pass(&store, &ctx, "m1").await.is_err());
        let kept = store.current("default", "m1").unwrap();
        assert!(kept.finalizers().contains(&MACHINE_FINALIZER.to_string()));
    }

    #[tokio::test]
    async fn test_delete_without_cluster_or_id_looks_up_by_name() {
        let mut m = deleting(owned(machine("m1")));
        m.status = Some(VpcMachineStatus {
            region: Some("eu-de".into()),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::with(vec![m]));
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_instance_by_name()
            .with(eq("m1"))
            .returning(|_| Ok(Some(instance(InstanceStatus::Running, None))));
        vpc.expect_delete_instance().with(eq("0717_i1")).times(1).returning(|_| Ok(()));
        let provider = Arc::new(StaticProvider {
            vpc: Some(Arc::new(vpc)),
            ..StaticProvider::default()
        });
        let ctx = Arc::new(
            test_context()
                .machines(store.clone())
                .vpc_clusters(Arc::new(MemoryStore::default()))
                .cloud(provider.clone())
                .build(),
        );
        pass(&store, &ctx, "m1").await.unwrap();
        assert!(store.current("default", "m1").is_none());
        assert_eq!(*provider.regions.lock().unwrap(), vec![Some("eu-de".to_string())]);
    }

    #[tokio::test]
    async fn test_first_pass_pins_region() {
        let store = Arc::new(MemoryStore::with(vec![machine("m1")]));
        let ctx = Arc::new(test_context().machines(store.clone()).vpc(MockVpcClient::new()).build());
        assert_eq!(pass(&store, &ctx, "m1").await.unwrap(), Action::requeue(Duration::ZERO));
        let pinned = store.current("default", "m1").unwrap();
        assert_eq!(pinned.region(), Some("us-south"));
        assert!(pinned.finalizers().contains(&MACHINE_FINALIZER.to_string()));
    }

    #[tokio::test]
    async fn test_delete_without_cluster_or_region_keeps_finalizer() {
        let m = deleting(with_instance(owned(machine("m1")), "10.0.0.5"));
        let store = Arc::new(MemoryStore::with(vec![m]));
        let mut vpc = MockVpcClient::new();
        vpc.expect_delete_instance().never();
        vpc.expect_get_instance_by_name().never();
        let ctx = Arc::new(
            test_context()
                .machines(store.clone())
                .vpc_clusters(Arc::new(MemoryStore::default()))
                .vpc(vpc)
                .build(),
        );
        let err = pass(&store, &ctx, "m1").await.unwrap_err();
        assert!(matches!(err, Error::UnknownTarget(_)));
        let kept = store.current("default", "m1").unwrap();
        assert!(kept.finalizers().contains(&MACHINE_FINALIZER.to_string()));
    }
}
