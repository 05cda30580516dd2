use crate::client::rest::{RestClientConfig, RestSpannerClient};
use crate::client::types::Dialect;
use crate::client::SpannerClient;
use crate::error::ResourceManagerError;
use crate::manager::SpannerResourceManager;
use crate::monitoring::{MonitoringClient, RestMonitoringConfig};
use crate::retry::ProvisioningRetryPolicy;
use clap::Parser;
use log::info;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Endpoint of the public Cloud Spanner REST API.
pub const DEFAULT_SPANNER_HOST: &str = "https://spanner.googleapis.com";

/// Endpoint of the public Cloud Monitoring REST API.
pub const DEFAULT_MONITORING_HOST: &str = "https://monitoring.googleapis.com";

/// Settings a test environment (CI job, developer shell) can inject without
/// touching test code. Every field is optional and falls back to an
/// environment variable.
#[derive(Parser, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct SpannerEnvironmentConfig {
    /// Project in which test resources are created.
    #[arg(long, env = "SPANNER_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Region of the instance configuration (e.g., `us-central1`).
    #[arg(long, env = "SPANNER_REGION")]
    pub region: Option<String>,

    /// Pre-existing instance to run against. When set, tests only create and
    /// drop databases and never create or delete instances.
    #[arg(long, env = "SPANNER_INSTANCE_ID")]
    pub static_instance_id: Option<String>,

    /// Spanner endpoint override, e.g. `http://localhost:9020` for the emulator.
    #[arg(long, env = "SPANNER_HOST")]
    pub host: Option<String>,

    /// OAuth2 access token sent as bearer token. Not needed for the emulator.
    #[arg(long, env = "SPANNER_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Cloud Monitoring endpoint override.
    #[arg(long, env = "MONITORING_HOST")]
    pub monitoring_host: Option<String>,
}

impl SpannerEnvironmentConfig {
    /// Reads the configuration from environment variables only.
    pub fn from_env() -> Result<Self, clap::Error> {
        Self::try_parse_from([env!("CARGO_PKG_NAME")])
    }

    /// Settings of a [`crate::monitoring::RestMonitoringClient`] for this environment.
    pub fn monitoring_config(&self) -> RestMonitoringConfig {
        RestMonitoringConfig {
            endpoint: self
                .monitoring_host
                .clone()
                .unwrap_or_else(|| DEFAULT_MONITORING_HOST.to_string()),
            access_token: self.access_token.clone(),
            ..RestMonitoringConfig::default()
        }
    }
}

/// Immutable configuration of a [`SpannerResourceManager`].
pub struct ResourceManagerConfig {
    test_id: String,
    project_id: String,
    region: String,
    dialect: Dialect,
    instance_id: Option<String>,
    use_static_instance: bool,
    node_count: u32,
    host: Option<String>,
    access_token: Option<String>,
    retry_policy: ProvisioningRetryPolicy,
    monitoring_client: Option<Box<dyn MonitoringClient>>,
}

impl ResourceManagerConfig {
    /// Starts a builder. `test_id` seeds the generated resource names and must not be empty.
    pub fn builder(
        test_id: impl Into<String>,
        project_id: impl Into<String>,
        region: impl Into<String>,
        dialect: Dialect,
    ) -> ResourceManagerBuilder {
        ResourceManagerBuilder {
            test_id: test_id.into(),
            project_id: project_id.into(),
            region: region.into(),
            dialect,
            instance_id: None,
            use_static_instance: false,
            node_count: 1,
            host: None,
            access_token: None,
            retry_backoff: ProvisioningRetryPolicy::DEFAULT_BACKOFF,
            monitoring_client: None,
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Explicit instance id, if one was configured.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn use_static_instance(&self) -> bool {
        self.use_static_instance
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn retry_policy(&self) -> &ProvisioningRetryPolicy {
        &self.retry_policy
    }

    pub fn monitoring_client(&self) -> Option<&dyn MonitoringClient> {
        self.monitoring_client.as_deref()
    }

    /// Configuration of the production REST client.
    pub fn rest_client_config(&self) -> RestClientConfig {
        RestClientConfig {
            endpoint: self
                .host
                .clone()
                .unwrap_or_else(|| DEFAULT_SPANNER_HOST.to_string()),
            access_token: self.access_token.clone(),
            ..RestClientConfig::default()
        }
    }
}

impl fmt::Debug for ResourceManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManagerConfig")
            .field("test_id", &self.test_id)
            .field("project_id", &self.project_id)
            .field("region", &self.region)
            .field("dialect", &self.dialect)
            .field("instance_id", &self.instance_id)
            .field("use_static_instance", &self.use_static_instance)
            .field("node_count", &self.node_count)
            .field("host", &self.host)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("retry_policy", &self.retry_policy)
            .field("monitoring_client", &self.monitoring_client.is_some())
            .finish()
    }
}

/// Builder of [`ResourceManagerConfig`]; `build*` validates and hands the
/// configuration to a new manager.
pub struct ResourceManagerBuilder {
    test_id: String,
    project_id: String,
    region: String,
    dialect: Dialect,
    instance_id: Option<String>,
    use_static_instance: bool,
    node_count: u32,
    host: Option<String>,
    access_token: Option<String>,
    retry_backoff: Duration,
    monitoring_client: Option<Box<dyn MonitoringClient>>,
}

impl ResourceManagerBuilder {
    /// Uses `instance_id` instead of a generated one.
    pub fn set_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Treats the instance as externally owned: it is neither created nor
    /// deleted, only the database is. Requires [`Self::set_instance_id`].
    pub fn use_static_instance(mut self) -> Self {
        self.use_static_instance = true;
        self
    }

    /// Runs against the static instance named by the environment, if any.
    pub fn maybe_use_static_instance(self, environment: &SpannerEnvironmentConfig) -> Self {
        match &environment.static_instance_id {
            Some(instance_id) => self.set_instance_id(instance_id).use_static_instance(),
            None => self,
        }
    }

    pub fn set_node_count(mut self, node_count: u32) -> Self {
        self.node_count = node_count;
        self
    }

    /// Talks to `host` instead of the public endpoint (e.g., the emulator).
    pub fn use_custom_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Applies the endpoint override and access token of the environment, if any.
    pub fn maybe_use_custom_host(mut self, environment: &SpannerEnvironmentConfig) -> Self {
        if let Some(host) = &environment.host {
            self.host = Some(host.clone());
        }
        if let Some(token) = &environment.access_token {
            self.access_token = Some(token.clone());
        }
        self
    }

    pub fn set_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    /// Pause before re-running provisioning after resource exhaustion.
    pub fn set_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Enables [`SpannerResourceManager::collect_metrics`].
    pub fn set_monitoring_client(mut self, monitoring_client: impl MonitoringClient + 'static) -> Self {
        self.monitoring_client = Some(Box::new(monitoring_client));
        self
    }

    /// Validates the settings into an immutable configuration.
    pub fn into_config(self) -> Result<ResourceManagerConfig, ResourceManagerError> {
        if self.test_id.is_empty() {
            return Err(ResourceManagerError::invalid_configuration(
                "test id cannot be empty",
            ));
        }
        if self.use_static_instance && self.instance_id.is_none() {
            return Err(ResourceManagerError::invalid_configuration(
                "a static instance requires an explicit instance id",
            ));
        }
        if self.instance_id.as_deref() == Some("") {
            return Err(ResourceManagerError::invalid_configuration(
                "instance id cannot be empty",
            ));
        }
        if self.node_count == 0 {
            return Err(ResourceManagerError::invalid_configuration(
                "node count must be at least 1",
            ));
        }
        Ok(ResourceManagerConfig {
            test_id: self.test_id,
            project_id: self.project_id,
            region: self.region,
            dialect: self.dialect,
            instance_id: self.instance_id,
            use_static_instance: self.use_static_instance,
            node_count: self.node_count,
            host: self.host,
            access_token: self.access_token,
            retry_policy: ProvisioningRetryPolicy::with_backoff(self.retry_backoff),
            monitoring_client: self.monitoring_client,
        })
    }

    /// Builds a manager that talks through `client`.
    pub fn build(
        self,
        client: impl SpannerClient + 'static,
    ) -> Result<SpannerResourceManager, ResourceManagerError> {
        Ok(SpannerResourceManager::new(
            self.into_config()?,
            Box::new(client),
        ))
    }

    /// Builds a manager backed by the REST API at the configured host.
    pub fn build_with_rest_client(self) -> Result<SpannerResourceManager, ResourceManagerError> {
        let config = self.into_config()?;
        let rest_config = config.rest_client_config();
        info!(
            "Using Spanner endpoint {} for project {}",
            rest_config.endpoint,
            config.project_id()
        );
        let client = RestSpannerClient::new(rest_config).map_err(|e| {
            ResourceManagerError::invalid_configuration(format!(
                "unable to create Spanner client: {e}"
            ))
        })?;
        Ok(SpannerResourceManager::new(config, Box::new(client)))
    }
}
