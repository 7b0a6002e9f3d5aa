//! Pool membership of machines in VPC load balancers
use crate::{
    Error, Result,
    cloud::{LoadBalancer, PoolRef, ProvisioningStatus, VpcClient},
};
use common::{
    VpcCluster,
    references::ResourceReference,
    vpcmachine::LoadBalancerPoolMember,
};
use kube::ResourceExt;
use tracing::{debug, info};

fn describe(r: &ResourceReference) -> String {
    r.id.clone().or_else(|| r.name.clone()).unwrap_or_default()
}

async fn find_load_balancer(vpc: &dyn VpcClient, r: &ResourceReference) -> Result<Option<LoadBalancer>> {
    let found = match (r.id.as_deref(), r.name.as_deref()) {
        (Some(id), _) => vpc.get_load_balancer(id).await?,
        (None, Some(name)) => vpc.get_load_balancer_by_name(name).await?,
        (None, None) => None,
    };
    Ok(found)
}

fn find_pool<'a>(lb: &'a LoadBalancer, r: &ResourceReference) -> Option<&'a PoolRef> {
    lb.pools.iter().find(|p| match (r.id.as_deref(), r.name.as_deref()) {
        (Some(id), _) => p.id == id,
        (None, Some(name)) => p.name == name,
        (None, None) => false,
    })
}

/// Address a control-plane machine can be bound with
pub fn usable_address(address: Option<&str>) -> Result<&str> {
    match address {
        Some(a) if !a.is_empty() && a != "0.0.0.0" => Ok(a),
        _ => Err(Error::InvalidPrimaryIp),
    }
}

/// Makes sure `address:port` is a member of the pool.
/// Returns true while the membership is not active yet.
async fn ensure_member(
    vpc: &dyn VpcClient,
    lb: &LoadBalancer,
    pool: &PoolRef,
    address: &str,
    port: i64,
    weight: Option<i64>,
) -> Result<bool> {
    let members = vpc.list_load_balancer_pool_members(&lb.id, &pool.id).await?;
    if let Some(member) = members
        .iter()
        .find(|m| m.address.as_deref() == Some(address) && m.port == port)
    {
        debug!("{address}:{port} is {} in pool {}", member.provisioning_status, pool.name);
        return Ok(member.provisioning_status != ProvisioningStatus::Active);
    }
    if lb.provisioning_status != ProvisioningStatus::Active {
        debug!("Load balancer {} is {}, waiting before adding {address}", lb.name, lb.provisioning_status);
        return Ok(true);
    }
    let created = vpc
        .create_load_balancer_pool_member(&lb.id, &pool.id, address, port, weight)
        .await?;
    info!("Added {address}:{port} to pool {} of {}", pool.name, lb.name);
    Ok(created.provisioning_status != ProvisioningStatus::Active)
}

/// Reconciles one declared membership, see [`ensure_member`]
pub async fn reconcile_member(vpc: &dyn VpcClient, member: &LoadBalancerPoolMember, address: &str) -> Result<bool> {
    let lb = find_load_balancer(vpc, &member.load_balancer)
        .await?
        .ok_or_else(|| Error::MissingLoadBalancer(describe(&member.load_balancer)))?;
    let pool = find_pool(&lb, &member.pool).ok_or_else(|| Error::MissingPool {
        load_balancer: lb.name.clone(),
        pool: describe(&member.pool),
    })?;
    ensure_member(vpc, &lb, pool, address, member.port, member.weight).await
}

/// Reconciles every declared membership; the first error aborts
pub async fn reconcile_members(vpc: &dyn VpcClient, members: &[LoadBalancerPoolMember], address: &str) -> Result<bool> {
    let mut needs_requeue = false;
    for member in members {
        needs_requeue |= reconcile_member(vpc, member, address).await?;
    }
    Ok(needs_requeue)
}

async fn control_plane_pool(vpc: &dyn VpcClient, cluster: &VpcCluster) -> Result<(LoadBalancer, PoolRef)> {
    let reference = cluster
        .control_plane_load_balancer()
        .ok_or_else(|| Error::MissingLoadBalancer(format!("control plane of {}", cluster.name_any())))?;
    let lb = vpc
        .get_load_balancer(&reference.id)
        .await?
        .ok_or_else(|| Error::MissingLoadBalancer(reference.id.clone()))?;
    let pool = lb.pools.first().cloned().ok_or_else(|| Error::MissingPool {
        load_balancer: lb.name.clone(),
        pool: "<first>".to_string(),
    })?;
    Ok((lb, pool))
}

/// Binds a control-plane machine into the first pool of the cluster's API server load balancer
pub async fn reconcile_control_plane_member(
    vpc: &dyn VpcClient,
    cluster: &VpcCluster,
    address: Option<&str>,
) -> Result<bool> {
    let address = usable_address(address)?;
    let (lb, pool) = control_plane_pool(vpc, cluster).await?;
    ensure_member(vpc, &lb, &pool, address, i64::from(cluster.api_server_port()), None).await
}

async fn remove_member(vpc: &dyn VpcClient, lb: &LoadBalancer, pool: &PoolRef, address: &str) -> Result<()> {
    let members = vpc.list_load_balancer_pool_members(&lb.id, &pool.id).await?;
    for member in members.iter().filter(|m| m.address.as_deref() == Some(address)) {
        match vpc.delete_load_balancer_pool_member(&lb.id, &pool.id, &member.id).await {
            Ok(()) => info!("Removed {address} from pool {} of {}", pool.name, lb.name),
            Err(e) if e.is_not_found() => debug!("Member {} already gone", member.id),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Removes `address` from every declared pool. Load balancers or pools that
/// no longer exist have nothing left to remove.
pub async fn deregister_members(vpc: &dyn VpcClient, members: &[LoadBalancerPoolMember], address: &str) -> Result<()> {
    for member in members {
        let Some(lb) = find_load_balancer(vpc, &member.load_balancer).await? else {
            continue;
        };
        if let Some(pool) = find_pool(&lb, &member.pool) {
            remove_member(vpc, &lb, pool, address).await?;
        }
    }
    Ok(())
}

pub async fn deregister_control_plane_member(vpc: &dyn VpcClient, cluster: &VpcCluster, address: &str) -> Result<()> {
    match control_plane_pool(vpc, cluster).await {
        Ok((lb, pool)) => remove_member(vpc, &lb, &pool, address).await,
        Err(Error::MissingLoadBalancer(_) | Error::MissingPool { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, MockVpcClient, PoolMember};
    use crate::testing::vpc_cluster;
    use mockall::predicate::eq;

    fn lb(status: ProvisioningStatus) -> LoadBalancer {
        LoadBalancer {
            id: "lb-1".into(),
            name: "api".into(),
            provisioning_status: status,
            pools: vec![PoolRef {
                id: "pool-1".into(),
                name: "apiserver".into(),
            }],
        }
    }

    fn member(address: &str, port: i64, status: ProvisioningStatus) -> PoolMember {
        PoolMember {
            id: format!("m-{address}"),
            address: Some(address.into()),
            port,
            provisioning_status: status,
        }
    }

    fn declared(pool: ResourceReference) -> LoadBalancerPoolMember {
        LoadBalancerPoolMember {
            load_balancer: ResourceReference::by_name("api"),
            pool,
            port: 443,
            weight: Some(50),
        }
    }

    #[tokio::test]
    async fn test_member_created_when_lb_active() {
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_load_balancer_by_name()
            .with(eq("api"))
            .returning(|_| Ok(Some(lb(ProvisioningStatus::Active))));
        vpc.expect_list_load_balancer_pool_members().returning(|_, _| Ok(vec![]));
        vpc.expect_create_load_balancer_pool_member()
            .withf(|lb, pool, addr, port, weight| {
                lb == "lb-1" && pool == "pool-1" && addr == "10.0.0.5" && *port == 443 && *weight == Some(50)
            })
            .times(1)
            .returning(|_, _, a, p, _| Ok(member(a, p, ProvisioningStatus::CreatePending)));
        let requeue = reconcile_member(&vpc, &declared(ResourceReference::by_name("apiserver")), "10.0.0.5")
            .await
            .unwrap();
        assert!(requeue);
    }

    #[tokio::test]
    async fn test_active_member_needs_nothing() {
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_load_balancer_by_name()
            .returning(|_| Ok(Some(lb(ProvisioningStatus::UpdatePending))));
        vpc.expect_list_load_balancer_pool_members()
            .returning(|_, _| Ok(vec![member("10.0.0.5", 443, ProvisioningStatus::Active)]));
        vpc.expect_create_load_balancer_pool_member().never();
        let requeue = reconcile_members(&vpc, &[declared(ResourceReference::by_id("pool-1"))], "10.0.0.5")
            .await
            .unwrap();
        assert!(!requeue);
    }

    #[tokio::test]
    async fn test_busy_lb_defers_creation() {
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_load_balancer_by_name()
            .returning(|_| Ok(Some(lb(ProvisioningStatus::UpdatePending))));
        vpc.expect_list_load_balancer_pool_members().returning(|_, _| Ok(vec![]));
        vpc.expect_create_load_balancer_pool_member().never();
        assert!(
            reconcile_member(&vpc, &declared(ResourceReference::by_id("pool-1")), "10.0.0.5")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_pool_is_an_error() {
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_load_balancer_by_name()
            .returning(|_| Ok(Some(lb(ProvisioningStatus::Active))));
        let err = reconcile_member(&vpc, &declared(ResourceReference::by_name("other")), "10.0.0.5")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingPool { .. }));
    }

    #[tokio::test]
    async fn test_control_plane_rejects_unspecified_address() {
        let vpc = MockVpcClient::new();
        let cluster = vpc_cluster("c1");
        for address in [None, Some(""), Some("0.0.0.0")] {
            let err = reconcile_control_plane_member(&vpc, &cluster, address).await.unwrap_err();
            assert_eq!(err.to_string(), "invalid primary ip address");
        }
    }

    #[tokio::test]
    async fn test_control_plane_uses_first_pool_and_api_port() {
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_load_balancer()
            .with(eq("lb-1"))
            .returning(|_| Ok(Some(lb(ProvisioningStatus::Active))));
        vpc.expect_list_load_balancer_pool_members().returning(|_, _| Ok(vec![]));
        vpc.expect_create_load_balancer_pool_member()
            .withf(|_, pool, _, port, weight| pool == "pool-1" && *port == 6443 && weight.is_none())
            .times(1)
            .returning(|_, _, a, p, _| Ok(member(a, p, ProvisioningStatus::Active)));
        let requeue = reconcile_control_plane_member(&vpc, &vpc_cluster("c1"), Some("10.0.0.7"))
            .await
            .unwrap();
        assert!(!requeue);
    }

    #[tokio::test]
    async fn test_deregistration_tolerates_gone_member() {
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_load_balancer()
            .returning(|_| Ok(Some(lb(ProvisioningStatus::Active))));
        vpc.expect_list_load_balancer_pool_members().returning(|_, _| {
            Ok(vec![
                member("10.0.0.7", 6443, ProvisioningStatus::Active),
                member("10.0.0.8", 6443, ProvisioningStatus::Active),
            ])
        });
        vpc.expect_delete_load_balancer_pool_member()
            .with(eq("lb-1"), eq("pool-1"), eq("m-10.0.0.7"))
            .times(1)
            .returning(|_, _, id| Err(CloudError::NotFound(id.to_string())));
        deregister_control_plane_member(&vpc, &vpc_cluster("c1"), "10.0.0.7")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deregistration_skips_vanished_lb() {
        let mut vpc = MockVpcClient::new();
        vpc.expect_get_load_balancer_by_name().returning(|_| Ok(None));
        deregister_members(&vpc, &[declared(ResourceReference::by_id("pool-1"))], "10.0.0.5")
            .await
            .unwrap();
    }
}
