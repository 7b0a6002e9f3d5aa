use super::{
    CloudError, CloudProvider, CloudResult, HealthReason, Image, ImageImportRequest, ImageReference,
    Instance, InstancePrototype, Job, LoadBalancer, PoolMember, PoolRef, PowerVsClient, PowerVsTarget,
    ProvisioningStatus, VpcClient,
};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

static VPC_API_VERSION: &str = "2024-11-12";
static TAGGING_ENDPOINT: &str = "https://tags.global-search-tagging.cloud.ibm.com/v3";
static USER_AGENT: &str = "capibm-controller";

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Exchanges an API key for bearer tokens, reusing each token until shortly before it expires
pub struct IamAuthenticator {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    token: Mutex<Option<CachedToken>>,
}

impl IamAuthenticator {
    #[must_use]
    pub fn new(http: Client, endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            token: Mutex::new(None),
        }
    }

    async fn bearer(&self) -> CloudResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.refresh_at > Instant::now()) {
            return Ok(token.value.clone());
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CloudError::Auth("no IAM API key configured".to_string()))?;
        let res = self
            .http
            .post(format!("{}/identity/token", self.endpoint))
            .form(&[
                ("grant_type", "urn:ibm:params:oauth:grant-type:apikey"),
                ("apikey", api_key),
            ])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(CloudError::Auth(format!("token exchange returned {}", res.status())));
        }
        let body: TokenResponse = res.json().await?;
        let lifetime = Duration::from_secs(body.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: body.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(body.access_token)
    }
}

#[derive(Clone)]
struct Rest {
    http: Client,
    auth: Arc<IamAuthenticator>,
}

impl Rest {
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> CloudResult<reqwest::Response> {
        debug!("{} {}", method, url);
        let mut req: RequestBuilder = self
            .http
            .request(method.clone(), url)
            .bearer_auth(self.auth.bearer().await?)
            .header("Accept", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }
        let res = req.send().await?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                method: method.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        Ok(res)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> CloudResult<T> {
        Ok(self.send(Method::GET, url, None).await?.json().await?)
    }

    async fn get_opt<T: DeserializeOwned>(&self, url: &str) -> CloudResult<Option<T>> {
        match self.get(url).await {
            Ok(v) => Ok(Some(v)),
            Err(CloudError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn post<T: DeserializeOwned>(&self, url: &str, body: &Value) -> CloudResult<T> {
        Ok(self.send(Method::POST, url, Some(body)).await?.json().await?)
    }

    async fn delete(&self, url: &str) -> CloudResult<()> {
        self.send(Method::DELETE, url, None).await.map(|_| ())
    }
}

#[derive(Deserialize)]
struct ReservedIpBody {
    address: String,
}

#[derive(Deserialize)]
struct NicBody {
    primary_ip: Option<ReservedIpBody>,
}

#[derive(Deserialize)]
struct HealthReasonBody {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct InstanceBody {
    id: String,
    name: String,
    crn: Option<String>,
    status: String,
    primary_network_interface: Option<NicBody>,
    #[serde(default)]
    health_reasons: Vec<HealthReasonBody>,
}

impl From<InstanceBody> for Instance {
    fn from(b: InstanceBody) -> Self {
        Instance {
            id: b.id,
            name: b.name,
            crn: b.crn,
            status: b.status.as_str().into(),
            primary_ip: b
                .primary_network_interface
                .and_then(|n| n.primary_ip)
                .map(|ip| ip.address),
            health_reasons: b
                .health_reasons
                .into_iter()
                .map(|r| HealthReason {
                    code: r.code,
                    message: r.message,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct InstanceList {
    instances: Vec<InstanceBody>,
}

#[derive(Deserialize)]
struct NamedId {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct ImageList {
    images: Vec<NamedId>,
}

#[derive(Deserialize)]
struct LoadBalancerBody {
    id: String,
    name: String,
    provisioning_status: String,
    #[serde(default)]
    pools: Vec<NamedId>,
}

impl From<LoadBalancerBody> for LoadBalancer {
    fn from(b: LoadBalancerBody) -> Self {
        LoadBalancer {
            id: b.id,
            name: b.name,
            provisioning_status: b.provisioning_status.as_str().into(),
            pools: b.pools.into_iter().map(|p| PoolRef { id: p.id, name: p.name }).collect(),
        }
    }
}

#[derive(Deserialize)]
struct Href {
    href: String,
}

#[derive(Deserialize)]
struct LoadBalancerList {
    load_balancers: Vec<LoadBalancerBody>,
    next: Option<Href>,
}

#[derive(Deserialize)]
struct MemberTarget {
    address: Option<String>,
}

#[derive(Deserialize)]
struct MemberBody {
    id: String,
    port: i64,
    provisioning_status: String,
    target: Option<MemberTarget>,
}

impl From<MemberBody> for PoolMember {
    fn from(b: MemberBody) -> Self {
        PoolMember {
            id: b.id,
            address: b.target.and_then(|t| t.address),
            port: b.port,
            provisioning_status: b.provisioning_status.as_str().into(),
        }
    }
}

#[derive(Deserialize)]
struct MemberList {
    members: Vec<MemberBody>,
}

pub struct VpcHttpClient {
    rest: Rest,
    base: String,
}

impl VpcHttpClient {
    fn url(&self, path: &str) -> String {
        let sep = if path.contains('?') { '&' } else { '?' };
        format!("{}{}{}version={}&generation=2", self.base, path, sep, VPC_API_VERSION)
    }

    async fn resolve_image(&self, name: &str) -> CloudResult<String> {
        let list: ImageList = self.rest.get(&self.url(&format!("/images?name={name}"))).await?;
        list.images
            .into_iter()
            .next()
            .map(|i| i.id)
            .ok_or_else(|| CloudError::NotFound(format!("image {name}")))
    }
}

#[async_trait]
impl VpcClient for VpcHttpClient {
    async fn get_instance(&self, id: &str) -> CloudResult<Option<Instance>> {
        let body: Option<InstanceBody> = self.rest.get_opt(&self.url(&format!("/instances/{id}"))).await?;
        Ok(body.map(Instance::from))
    }

    async fn get_instance_by_name(&self, name: &str) -> CloudResult<Option<Instance>> {
        let list: InstanceList = self.rest.get(&self.url(&format!("/instances?name={name}"))).await?;
        Ok(list.instances.into_iter().next().map(Instance::from))
    }

    async fn create_instance(&self, p: &InstancePrototype) -> CloudResult<Instance> {
        let image = match (&p.image_id, &p.image_name) {
            (Some(id), _) => id.clone(),
            (None, Some(name)) => self.resolve_image(name).await?,
            (None, None) => return Err(CloudError::Unexpected(format!("instance {} has no image", p.name))),
        };
        let mut body = json!({
            "name": p.name,
            "zone": { "name": p.zone },
            "profile": { "name": p.profile },
            "image": { "id": image },
            "keys": p.ssh_keys.iter().map(|k| json!({ "id": k })).collect::<Vec<_>>(),
            "primary_network_interface": { "subnet": { "id": p.subnet } },
        });
        if let Some(vpc) = &p.vpc {
            body["vpc"] = json!({ "id": vpc });
        }
        if let Some(rg) = &p.resource_group {
            body["resource_group"] = json!({ "id": rg });
        }
        if let Some(user_data) = &p.user_data {
            body["user_data"] = json!(user_data);
        }
        let created: InstanceBody = self.rest.post(&self.url("/instances"), &body).await?;
        Ok(created.into())
    }

    async fn delete_instance(&self, id: &str) -> CloudResult<()> {
        self.rest.delete(&self.url(&format!("/instances/{id}"))).await
    }

    async fn tag_resource(&self, tag: &str, crn: &str) -> CloudResult<()> {
        let body = json!({
            "resources": [{ "resource_id": crn }],
            "tag_names": [tag],
        });
        let _: Value = self
            .rest
            .post(&format!("{TAGGING_ENDPOINT}/tags/attach?tag_type=user"), &body)
            .await?;
        Ok(())
    }

    async fn get_load_balancer(&self, id: &str) -> CloudResult<Option<LoadBalancer>> {
        let body: Option<LoadBalancerBody> = self
            .rest
            .get_opt(&self.url(&format!("/load_balancers/{id}")))
            .await?;
        Ok(body.map(LoadBalancer::from))
    }

    async fn get_load_balancer_by_name(&self, name: &str) -> CloudResult<Option<LoadBalancer>> {
        let mut url = self.url("/load_balancers?limit=50");
        loop {
            let page: LoadBalancerList = self.rest.get(&url).await?;
            if let Some(lb) = page.load_balancers.into_iter().find(|lb| lb.name == name) {
                return Ok(Some(lb.into()));
            }
            match page.next {
                Some(next) => url = next.href,
                None => return Ok(None),
            }
        }
    }

    async fn list_load_balancer_pool_members(&self, lb_id: &str, pool_id: &str) -> CloudResult<Vec<PoolMember>> {
        let list: MemberList = self
            .rest
            .get(&self.url(&format!("/load_balancers/{lb_id}/pools/{pool_id}/members")))
            .await?;
        Ok(list.members.into_iter().map(PoolMember::from).collect())
    }

    async fn create_load_balancer_pool_member(
        &self,
        lb_id: &str,
        pool_id: &str,
        address: &str,
        port: i64,
        weight: Option<i64>,
    ) -> CloudResult<PoolMember> {
        let mut body = json!({ "port": port, "target": { "address": address } });
        if let Some(weight) = weight {
            body["weight"] = json!(weight);
        }
        let created: MemberBody = self
            .rest
            .post(&self.url(&format!("/load_balancers/{lb_id}/pools/{pool_id}/members")), &body)
            .await?;
        Ok(created.into())
    }

    async fn delete_load_balancer_pool_member(&self, lb_id: &str, pool_id: &str, member_id: &str) -> CloudResult<()> {
        self.rest
            .delete(&self.url(&format!("/load_balancers/{lb_id}/pools/{pool_id}/members/{member_id}")))
            .await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CosImageImportBody<'a> {
    image_name: &'a str,
    bucket_name: &'a str,
    bucket_access: &'a str,
    region: &'a str,
    image_filename: &'a str,
    storage_type: &'a str,
}

#[derive(Deserialize)]
struct JobReferenceBody {
    id: String,
}

#[derive(Deserialize)]
struct JobStatusBody {
    state: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct JobBody {
    id: String,
    status: JobStatusBody,
}

#[derive(Deserialize)]
struct PvsImageBody {
    #[serde(rename = "imageID")]
    image_id: String,
    name: String,
    #[serde(default)]
    state: String,
}

#[derive(Deserialize)]
struct PvsImageList {
    images: Vec<PvsImageBody>,
}

pub struct PowerVsHttpClient {
    rest: Rest,
    base: String,
}

#[async_trait]
impl PowerVsClient for PowerVsHttpClient {
    async fn create_image_import_job(&self, r: &ImageImportRequest) -> CloudResult<String> {
        let body = serde_json::to_value(CosImageImportBody {
            image_name: &r.image_name,
            bucket_name: &r.bucket,
            bucket_access: "public",
            region: &r.region,
            image_filename: &r.object,
            storage_type: &r.storage_type,
        })
        .map_err(|e| CloudError::Unexpected(e.to_string()))?;
        let job: JobReferenceBody = self.rest.post(&format!("{}/cos-images", self.base), &body).await?;
        Ok(job.id)
    }

    async fn get_job(&self, id: &str) -> CloudResult<Job> {
        let job: JobBody = self.rest.get(&format!("{}/jobs/{id}", self.base)).await?;
        Ok(Job {
            id: job.id,
            state: job.status.state.as_str().into(),
            message: job.status.message,
        })
    }

    async fn delete_job(&self, id: &str) -> CloudResult<()> {
        self.rest.delete(&format!("{}/jobs/{id}", self.base)).await
    }

    async fn get_all_images(&self) -> CloudResult<Vec<ImageReference>> {
        let list: PvsImageList = self.rest.get(&format!("{}/images", self.base)).await?;
        Ok(list
            .images
            .into_iter()
            .map(|i| ImageReference {
                id: i.image_id,
                name: i.name,
            })
            .collect())
    }

    async fn get_image(&self, id: &str) -> CloudResult<Image> {
        let i: PvsImageBody = self.rest.get(&format!("{}/images/{id}", self.base)).await?;
        Ok(Image {
            id: i.image_id,
            name: i.name,
            state: i.state.as_str().into(),
        })
    }

    async fn delete_image(&self, id: &str) -> CloudResult<()> {
        self.rest.delete(&format!("{}/images/{id}", self.base)).await
    }
}

/// Builds HTTP clients sharing one connection pool and one IAM token cache
pub struct HttpProvider {
    rest: Rest,
    vpc_region: String,
    powervs_region: String,
}

impl HttpProvider {
    pub fn new(
        iam_endpoint: &str,
        api_key: Option<String>,
        vpc_region: &str,
        powervs_region: &str,
    ) -> CloudResult<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .use_rustls_tls()
            .build()?;
        let auth = Arc::new(IamAuthenticator::new(http.clone(), iam_endpoint, api_key));
        Ok(Self {
            rest: Rest { http, auth },
            vpc_region: vpc_region.to_string(),
            powervs_region: powervs_region.to_string(),
        })
    }
}

impl CloudProvider for HttpProvider {
    fn vpc(&self, region: Option<&str>) -> Arc<dyn VpcClient> {
        let region = region.unwrap_or(&self.vpc_region);
        Arc::new(VpcHttpClient {
            rest: self.rest.clone(),
            base: format!("https://{region}.iaas.cloud.ibm.com/v1"),
        })
    }

    fn powervs(&self, target: &PowerVsTarget) -> Arc<dyn PowerVsClient> {
        let region = target.region.as_deref().unwrap_or(&self.powervs_region);
        let workspace = target.service_instance_id.as_deref().unwrap_or_default();
        Arc::new(PowerVsHttpClient {
            rest: self.rest.clone(),
            base: format!("https://{region}.power-iaas.cloud.ibm.com/pcloud/v1/cloud-instances/{workspace}"),
        })
    }
}
