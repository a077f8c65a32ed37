//! The control plane's configuration
//!
//! Unknown keys are ignored by the underlying [`config`] crate. Every
//! duration/count field is validated independently: an invalid value (zero
//! or negative where a positive value is required) is silently replaced
//! with its documented default. [`Config::validate`] is pure and
//! idempotent — running it twice never changes the result a second time.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Helps serde default a bool to false
fn default_false() -> bool {
    false
}

/// The deployment back-end a scaler instance targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentBackend {
    K8s,
    Docker,
    Novita,
    Custom,
}

impl Default for DeploymentBackend {
    fn default() -> Self {
        DeploymentBackend::K8s
    }
}

/// `server` config block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConf {
    #[serde(default = "ServerConf::default_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: ServerMode,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl ServerConf {
    fn default_port() -> u16 {
        8080
    }
}

impl Default for ServerConf {
    fn default() -> Self {
        ServerConf {
            port: Self::default_port(),
            mode: ServerMode::default(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Debug,
    Release,
}

impl Default for ServerMode {
    fn default() -> Self {
        ServerMode::Release
    }
}

/// `queue` config block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConf {
    #[serde(default = "QueueConf::default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "QueueConf::default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "QueueConf::default_task_timeout")]
    pub task_timeout: u64,
}

impl QueueConf {
    fn default_concurrency() -> u32 {
        4
    }
    fn default_max_retry() -> u32 {
        3
    }
    fn default_task_timeout() -> u64 {
        300
    }
}

impl Default for QueueConf {
    fn default() -> Self {
        QueueConf {
            concurrency: Self::default_concurrency(),
            max_retry: Self::default_max_retry(),
            task_timeout: Self::default_task_timeout(),
        }
    }
}

/// `worker` config block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConf {
    #[serde(default = "WorkerConf::default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "WorkerConf::default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    #[serde(default = "WorkerConf::default_concurrency")]
    pub default_concurrency: u32,
}

impl WorkerConf {
    fn default_heartbeat_interval() -> u64 {
        10
    }
    fn default_heartbeat_timeout() -> u64 {
        60
    }
    fn default_concurrency() -> u32 {
        1
    }
}

impl Default for WorkerConf {
    fn default() -> Self {
        WorkerConf {
            heartbeat_interval: Self::default_heartbeat_interval(),
            heartbeat_timeout: Self::default_heartbeat_timeout(),
            default_concurrency: Self::default_concurrency(),
        }
    }
}

/// Which k8s platform flavor a cluster runs on; some back-ends expose
/// platform-specific node-pool/claim semantics the capacity manager uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum K8sPlatform {
    Generic,
    AliyunAck,
    AwsEks,
}

impl Default for K8sPlatform {
    fn default() -> Self {
        K8sPlatform::Generic
    }
}

/// `k8s` config block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K8sConf {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "K8sConf::default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub platform: K8sPlatform,
    #[serde(default)]
    pub config_dir: Option<String>,
}

impl K8sConf {
    fn default_namespace() -> String {
        "default".into()
    }
}

impl Default for K8sConf {
    fn default() -> Self {
        K8sConf {
            enabled: false,
            namespace: Self::default_namespace(),
            platform: K8sPlatform::default(),
            config_dir: None,
        }
    }
}

/// `novita` (remote provider) config block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovitaConf {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub config_dir: Option<String>,
    #[serde(default = "NovitaConf::default_poll_interval")]
    pub poll_interval: u64,
}

impl NovitaConf {
    fn default_poll_interval() -> u64 {
        10
    }
}

impl Default for NovitaConf {
    fn default() -> Self {
        NovitaConf {
            enabled: false,
            api_key: None,
            base_url: None,
            config_dir: None,
            poll_interval: Self::default_poll_interval(),
        }
    }
}

/// `providers` config block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConf {
    #[serde(default)]
    pub deployment: DeploymentBackend,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
}

impl Default for ProvidersConf {
    fn default() -> Self {
        ProvidersConf {
            deployment: DeploymentBackend::default(),
            queue: None,
            metadata: None,
        }
    }
}

/// `autoscaler` config block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConf {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "AutoscalerConf::default_interval")]
    pub interval: u64,
    #[serde(default = "AutoscalerConf::default_max_gpu_count")]
    pub max_gpu_count: u32,
    #[serde(default = "AutoscalerConf::default_max_cpu_cores")]
    pub max_cpu_cores: u32,
    #[serde(default = "AutoscalerConf::default_max_memory_gb")]
    pub max_memory_gb: u32,
    #[serde(default = "AutoscalerConf::default_starvation_time")]
    pub starvation_time: u64,
}

impl AutoscalerConf {
    fn default_interval() -> u64 {
        10
    }
    fn default_max_gpu_count() -> u32 {
        64
    }
    fn default_max_cpu_cores() -> u32 {
        512
    }
    fn default_max_memory_gb() -> u32 {
        2048
    }
    fn default_starvation_time() -> u64 {
        120
    }
}

impl Default for AutoscalerConf {
    fn default() -> Self {
        AutoscalerConf {
            enabled: true,
            interval: Self::default_interval(),
            max_gpu_count: Self::default_max_gpu_count(),
            max_cpu_cores: Self::default_max_cpu_cores(),
            max_memory_gb: Self::default_max_memory_gb(),
            starvation_time: Self::default_starvation_time(),
        }
    }
}

/// `imageValidation` config block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageValidationConf {
    #[serde(default = "ImageValidationConf::default_timeout")]
    pub timeout: u64,
    #[serde(default = "ImageValidationConf::default_cache_duration")]
    pub cache_duration: u64,
}

impl ImageValidationConf {
    fn default_timeout() -> u64 {
        30
    }
    fn default_cache_duration() -> u64 {
        3600
    }
}

impl Default for ImageValidationConf {
    fn default() -> Self {
        ImageValidationConf {
            timeout: Self::default_timeout(),
            cache_duration: Self::default_cache_duration(),
        }
    }
}

/// `resourceReleaser` config block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReleaserConf {
    #[serde(default = "ResourceReleaserConf::default_image_pull_timeout")]
    pub image_pull_timeout: u64,
    #[serde(default = "ResourceReleaserConf::default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "ResourceReleaserConf::default_max_retries")]
    pub max_retries: u32,
}

impl ResourceReleaserConf {
    fn default_image_pull_timeout() -> u64 {
        300
    }
    fn default_check_interval() -> u64 {
        30
    }
    fn default_max_retries() -> u32 {
        3
    }
}

impl Default for ResourceReleaserConf {
    fn default() -> Self {
        ResourceReleaserConf {
            image_pull_timeout: Self::default_image_pull_timeout(),
            check_interval: Self::default_check_interval(),
            max_retries: Self::default_max_retries(),
        }
    }
}

/// The fully assembled control plane configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConf,
    #[serde(default)]
    pub queue: QueueConf,
    #[serde(default)]
    pub worker: WorkerConf,
    #[serde(default)]
    pub k8s: K8sConf,
    #[serde(default)]
    pub novita: NovitaConf,
    #[serde(default)]
    pub providers: ProvidersConf,
    #[serde(default)]
    pub autoscaler: AutoscalerConf,
    #[serde(default, rename = "imageValidation")]
    pub image_validation: ImageValidationConf,
    #[serde(default, rename = "resourceReleaser")]
    pub resource_releaser: ResourceReleaserConf,
}

/// Replace `value` with `default` if `value` is not strictly positive
fn positive_or<T: PartialOrd + Default>(value: T, default: T) -> T {
    if value > T::default() {
        value
    } else {
        default
    }
}

impl Config {
    /// Load a config from a YAML file on disk, then validate it
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the YAML config file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let built = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("FLEET").separator("__"))
            .build()?;
        let raw: Config = built.try_deserialize()?;
        Ok(raw.validate())
    }

    /// Deterministically normalize this config, replacing any invalid field
    /// with its documented default. Calling this twice is a no-op the
    /// second time.
    #[must_use]
    pub fn validate(mut self) -> Self {
        self.queue.concurrency = positive_or(self.queue.concurrency, QueueConf::default_concurrency());
        self.queue.task_timeout = positive_or(self.queue.task_timeout, QueueConf::default_task_timeout());
        self.worker.heartbeat_interval = positive_or(
            self.worker.heartbeat_interval,
            WorkerConf::default_heartbeat_interval(),
        );
        self.worker.heartbeat_timeout = positive_or(
            self.worker.heartbeat_timeout,
            WorkerConf::default_heartbeat_timeout(),
        );
        self.worker.default_concurrency = positive_or(
            self.worker.default_concurrency,
            WorkerConf::default_concurrency(),
        );
        self.novita.poll_interval =
            positive_or(self.novita.poll_interval, NovitaConf::default_poll_interval());
        self.autoscaler.interval =
            positive_or(self.autoscaler.interval, AutoscalerConf::default_interval());
        self.autoscaler.max_gpu_count = positive_or(
            self.autoscaler.max_gpu_count,
            AutoscalerConf::default_max_gpu_count(),
        );
        self.autoscaler.max_cpu_cores = positive_or(
            self.autoscaler.max_cpu_cores,
            AutoscalerConf::default_max_cpu_cores(),
        );
        self.autoscaler.max_memory_gb = positive_or(
            self.autoscaler.max_memory_gb,
            AutoscalerConf::default_max_memory_gb(),
        );
        self.autoscaler.starvation_time = positive_or(
            self.autoscaler.starvation_time,
            AutoscalerConf::default_starvation_time(),
        );
        self.image_validation.timeout =
            positive_or(self.image_validation.timeout, ImageValidationConf::default_timeout());
        self.image_validation.cache_duration = positive_or(
            self.image_validation.cache_duration,
            ImageValidationConf::default_cache_duration(),
        );
        self.resource_releaser.image_pull_timeout = positive_or(
            self.resource_releaser.image_pull_timeout,
            ResourceReleaserConf::default_image_pull_timeout(),
        );
        self.resource_releaser.check_interval = positive_or(
            self.resource_releaser.check_interval,
            ResourceReleaserConf::default_check_interval(),
        );
        // max_retries may legitimately be 0 (no retries); only a negative
        // value (impossible for u32, but kept symmetric for signed inputs
        // coming from YAML/env as strings) is invalid. u32 can't go
        // negative so there is nothing further to clamp here, but the
        // field is still listed for documentation symmetry with its siblings.
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_is_idempotent() {
        let cfg = Config::default();
        let once = cfg.clone().validate();
        let twice = once.clone().validate();
        assert_eq!(
            serde_json::to_string(&once).unwrap(),
            serde_json::to_string(&twice).unwrap()
        );
    }

    #[test]
    fn invalid_durations_fall_back_to_defaults() {
        let mut cfg = Config::default();
        cfg.autoscaler.interval = 0;
        cfg.resource_releaser.check_interval = 0;
        cfg.worker.heartbeat_interval = 0;
        let validated = cfg.validate();
        assert_eq!(validated.autoscaler.interval, AutoscalerConf::default_interval());
        assert_eq!(
            validated.resource_releaser.check_interval,
            ResourceReleaserConf::default_check_interval()
        );
        assert_eq!(
            validated.worker.heartbeat_interval,
            WorkerConf::default_heartbeat_interval()
        );
    }

    #[test]
    fn valid_values_pass_through_unchanged() {
        let mut cfg = Config::default();
        cfg.autoscaler.interval = 42;
        cfg.resource_releaser.max_retries = 7;
        let validated = cfg.validate();
        assert_eq!(validated.autoscaler.interval, 42);
        assert_eq!(validated.resource_releaser.max_retries, 7);
    }
}
