// ABOUTME: Container runtime abstraction used by the orchestrator
// ABOUTME: Narrow async interface over networks, containers and images with Docker-independent types

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

use crate::finalize::RuntimeConfig;
use crate::labels;
use crate::Result;

pub mod docker;

pub use docker::DockerRuntime;

/// Bridge network as seen by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    /// Ids of the containers attached to the network. Only populated by
    /// `inspect_network`.
    pub containers: Vec<String>,
}

/// A container's address on one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerNetwork {
    pub network_id: String,
    pub ip_address: String,
    pub ip_prefix_len: i64,
}

impl ContainerNetwork {
    /// `ip/prefix`, e.g. `10.0.0.5/24`.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ip_address, self.ip_prefix_len)
    }
}

/// Attachment of a container to a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub network_id: String,
    pub network_name: String,
    pub aliases: Vec<String>,
}

/// Container as returned by a list call. Networks are keyed by network name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub networks: BTreeMap<String, ContainerNetwork>,
}

impl ContainerSummary {
    pub fn agreement_id(&self) -> Option<&str> {
        labels::agreement_id(&self.labels)
    }

    pub fn service_name(&self) -> Option<&str> {
        labels::service_name(&self.labels)
    }

    pub fn is_singleton(&self) -> bool {
        labels::is_singleton(&self.labels)
    }

    /// Whether the container is known under `name`, ignoring Docker's leading `/`.
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.trim_start_matches('/') == name)
    }
}

/// Full inspection result of one container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub running: bool,
    pub networks: BTreeMap<String, ContainerNetwork>,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub config: RuntimeConfig,
    /// Primary network; used as the container's network mode.
    pub network: EndpointConfig,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>>;

    async fn inspect_network(&self, network_id: &str) -> Result<NetworkInfo>;

    /// Create a bridge network with inter-container traffic and IP masquerade enabled.
    async fn create_network(&self, name: &str) -> Result<NetworkInfo>;

    /// Removing a network that no longer exists succeeds.
    async fn remove_network(&self, network_id: &str) -> Result<()>;

    async fn connect_network(&self, container_id: &str, endpoint: &EndpointConfig) -> Result<()>;

    async fn disconnect_network(&self, network_id: &str, container_id: &str) -> Result<()>;

    /// Returns the id of the created container.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Returns `false` when the container was already gone.
    async fn kill_container(&self, container_id: &str) -> Result<bool>;

    /// Forced removal including volumes. Removing a missing container succeeds.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetail>;

    /// Containers matching every `key=value` label filter.
    async fn list_containers(
        &self,
        label_filters: &[String],
        include_stopped: bool,
    ) -> Result<Vec<ContainerSummary>>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Load an image archive (`docker load` format) into the local store.
    async fn load_image(&self, archive: &Path) -> Result<()>;
}
