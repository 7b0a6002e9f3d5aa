use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Parameters {
    /// Address the metrics and health server listens on
    #[arg(long = "listen", env = "LISTEN_ADDRESS", value_name = "LISTEN_ADDRESS", default_value = "0.0.0.0:9000")]
    pub listen: String,
    /// Emit logs as JSON lines
    #[arg(long = "log-json", env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
    /// IBM Cloud API key exchanged for IAM tokens
    #[arg(long = "api-key", env = "IBMCLOUD_API_KEY", value_name = "IBMCLOUD_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    /// IAM endpoint
    #[arg(
        long = "iam-endpoint",
        env = "IBMCLOUD_IAM_ENDPOINT",
        value_name = "IAM_ENDPOINT",
        default_value = "https://iam.cloud.ibm.com"
    )]
    pub iam_endpoint: String,
    /// VPC region used when a cluster does not name one
    #[arg(long = "vpc-region", env = "VPC_REGION", value_name = "VPC_REGION", default_value = "us-south")]
    pub vpc_region: String,
    /// PowerVS region used when a cluster does not name one
    #[arg(
        long = "powervs-region",
        env = "POWERVS_REGION",
        value_name = "POWERVS_REGION",
        default_value = "us-south"
    )]
    pub powervs_region: String,
    /// Objects of one kind reconciled in parallel
    #[arg(long = "concurrency", env = "CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,
    /// Upper bound for a single reconcile pass, in seconds
    #[arg(long = "reconcile-timeout", env = "RECONCILE_TIMEOUT", default_value_t = 300)]
    pub reconcile_timeout: u64,
    /// Extra attempts when persisting hits a conflict
    #[arg(long = "close-retries", env = "CLOSE_RETRIES", default_value_t = 2)]
    pub close_retries: u32,
    /// Seconds between import job polls
    #[arg(long = "job-poll", env = "JOB_POLL_INTERVAL", default_value_t = 120)]
    pub job_poll: u64,
    /// Seconds between instance state polls
    #[arg(long = "instance-poll", env = "INSTANCE_POLL_INTERVAL", default_value_t = 60)]
    pub instance_poll: u64,
    /// Seconds between image state polls
    #[arg(long = "image-poll", env = "IMAGE_POLL_INTERVAL", default_value_t = 60)]
    pub image_poll: u64,
    /// Seconds to wait after a failed pass that did not ask for anything else
    #[arg(long = "error-backoff", env = "ERROR_BACKOFF", default_value_t = 300)]
    pub error_backoff: u64,
}

/// Timing knobs handed to every reconcile pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub job_poll: Duration,
    pub instance_poll: Duration,
    pub image_poll: Duration,
    pub error_backoff: Duration,
    pub reconcile_timeout: Duration,
    pub close_retries: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            job_poll: Duration::from_secs(2 * 60),
            instance_poll: Duration::from_secs(60),
            image_poll: Duration::from_secs(60),
            error_backoff: Duration::from_secs(5 * 60),
            reconcile_timeout: Duration::from_secs(5 * 60),
            close_retries: 2,
        }
    }
}

impl From<&Parameters> for ReconcileSettings {
    fn from(p: &Parameters) -> Self {
        Self {
            job_poll: Duration::from_secs(p.job_poll),
            instance_poll: Duration::from_secs(p.instance_poll),
            image_poll: Duration::from_secs(p.image_poll),
            error_backoff: Duration::from_secs(p.error_backoff),
            reconcile_timeout: Duration::from_secs(p.reconcile_timeout),
            close_retries: p.close_retries,
        }
    }
}
