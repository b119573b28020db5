// ABOUTME: Docker implementation of the container runtime via bollard
// ABOUTME: Maps runtime configuration onto Docker create bodies and tolerates already-removed objects

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
        ListContainersOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
    },
    errors::Error as BollardError,
    image::ImportImageOptions,
    models::{
        DeviceMapping, EndpointSettings, HostConfig, HostConfigLogConfig, PortBinding,
        RestartPolicy as DockerRestartPolicy, RestartPolicyNameEnum,
    },
    network::{
        ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions,
        InspectNetworkOptions, ListNetworksOptions,
    },
    Docker, API_DEFAULT_VERSION,
};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, error, info};

use super::{
    ContainerDetail, ContainerNetwork, ContainerRuntime, ContainerSpec, ContainerSummary,
    EndpointConfig, NetworkInfo,
};
use crate::finalize::{RestartPolicy, RuntimeConfig};
use crate::{ContainerError, Result};

/// Seconds before a Docker API call times out.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Bridge driver options applied to every network we create.
const BRIDGE_OPTIONS: [(&str, &str); 3] = [
    ("com.docker.network.bridge.enable_icc", "true"),
    ("com.docker.network.bridge.enable_ip_masquerade", "true"),
    ("com.docker.network.bridge.default_bridge", "false"),
];

fn is_status(e: &BollardError, code: u16) -> bool {
    matches!(e, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

fn to_networks(
    networks: Option<HashMap<String, EndpointSettings>>,
) -> BTreeMap<String, ContainerNetwork> {
    networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| {
            (
                name,
                ContainerNetwork {
                    network_id: endpoint.network_id.unwrap_or_default(),
                    ip_address: endpoint.ip_address.unwrap_or_default(),
                    ip_prefix_len: endpoint.ip_prefix_len.unwrap_or_default(),
                },
            )
        })
        .collect()
}

fn to_endpoint_settings(endpoint: &EndpointConfig) -> EndpointSettings {
    EndpointSettings {
        network_id: Some(endpoint.network_id.clone()),
        aliases: Some(endpoint.aliases.clone()),
        ..Default::default()
    }
}

/// Container runtime backed by a Docker daemon.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to `endpoint` (`unix://...` or `tcp://...`), or to the local defaults.
    pub fn connect(endpoint: Option<&str>) -> Result<Self> {
        let client = match endpoint {
            Some(socket) if socket.starts_with("unix://") => {
                Docker::connect_with_socket(socket, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Some(addr) => Docker::connect_with_http(addr, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?,
            None => Docker::connect_with_defaults()?,
        };

        info!("Connected to Docker at {}", endpoint.unwrap_or("local defaults"));
        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await.map_err(|e| {
            error!("Failed to reach Docker daemon: {}", e);
            ContainerError::Docker(e)
        })?;
        Ok(())
    }

    fn to_host_config(config: &RuntimeConfig, network_mode: &str) -> HostConfig {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = config
            .port_bindings
            .iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .iter()
                    .map(|b| PortBinding {
                        host_ip: Some(b.host_ip.clone()),
                        host_port: Some(b.host_port.clone()),
                    })
                    .collect();
                (port.clone(), Some(bindings))
            })
            .collect();

        let devices = config
            .devices
            .iter()
            .map(|d| DeviceMapping {
                path_on_host: Some(d.path_on_host.clone()),
                path_in_container: Some(d.path_in_container.clone()),
                cgroup_permissions: Some("rwm".to_string()),
            })
            .collect();

        let restart = match config.restart_policy {
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        };

        HostConfig {
            binds: Some(config.binds.clone()),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            privileged: Some(config.privileged),
            cap_add: Some(config.cap_add.clone()),
            memory: Some(config.memory_bytes),
            cpuset_cpus: config.cpuset.clone(),
            devices: Some(devices),
            network_mode: Some(network_mode.to_string()),
            restart_policy: Some(DockerRestartPolicy {
                name: Some(restart),
                maximum_retry_count: None,
            }),
            log_config: Some(HostConfigLogConfig {
                typ: Some(config.log_config.driver.clone()),
                config: Some(HashMap::from([(
                    "tag".to_string(),
                    config.log_config.tag.clone(),
                )])),
            }),
            ..Default::default()
        }
    }

    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let config = &spec.config;

        let exposed_ports = config
            .exposed_ports
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let endpoints_config = HashMap::from([(
            spec.network.network_name.clone(),
            to_endpoint_settings(&spec.network),
        )]);

        Config {
            image: Some(config.image.clone()),
            env: Some(config.env.clone()),
            cmd: if config.cmd.is_empty() {
                None
            } else {
                Some(config.cmd.clone())
            },
            labels: Some(config.labels.clone().into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(Self::to_host_config(config, &spec.network.network_name)),
            networking_config: Some(NetworkingConfig { endpoints_config }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let networks = self
            .client
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;

        Ok(networks
            .into_iter()
            .map(|n| NetworkInfo {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                containers: n
                    .containers
                    .map(|c| c.into_keys().collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_network(&self, network_id: &str) -> Result<NetworkInfo> {
        let network = self
            .client
            .inspect_network(network_id, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    ContainerError::NotFound(format!("network {}", network_id))
                } else {
                    ContainerError::Docker(e)
                }
            })?;

        Ok(NetworkInfo {
            id: network.id.unwrap_or_else(|| network_id.to_string()),
            name: network.name.unwrap_or_default(),
            containers: network
                .containers
                .map(|c| c.into_keys().collect())
                .unwrap_or_default(),
        })
    }

    async fn create_network(&self, name: &str) -> Result<NetworkInfo> {
        debug!("Creating bridge network {}", name);

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            options: BRIDGE_OPTIONS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };

        self.client.create_network(options).await.map_err(|e| {
            error!("Failed to create network {}: {}", name, e);
            ContainerError::Docker(e)
        })?;

        // look the network up again so callers get the daemon's view of it
        let network = self
            .list_networks()
            .await?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| {
                ContainerError::Runtime(format!("network {} missing after creation", name))
            })?;

        info!("Created network {} ({})", name, network.id);
        Ok(network)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        match self.client.remove_network(network_id).await {
            Ok(_) => {
                info!("Removed network {}", network_id);
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                debug!("Network {} already removed", network_id);
                Ok(())
            }
            Err(e) => Err(ContainerError::Docker(e)),
        }
    }

    async fn connect_network(&self, container_id: &str, endpoint: &EndpointConfig) -> Result<()> {
        debug!(
            "Connecting container {} to network {}",
            container_id, endpoint.network_name
        );

        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: to_endpoint_settings(endpoint),
        };
        self.client
            .connect_network(&endpoint.network_id, options)
            .await?;
        Ok(())
    }

    async fn disconnect_network(&self, network_id: &str, container_id: &str) -> Result<()> {
        let options = DisconnectNetworkOptions {
            container: container_id.to_string(),
            force: true,
        };
        match self.client.disconnect_network(network_id, options).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(ContainerError::Docker(e)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        debug!("Creating container {} from {}", spec.name, spec.config.image);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| {
                error!("Failed to create container {}: {}", spec.name, e);
                ContainerError::Docker(e)
            })?;

        info!("Created container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!("Started container {}", container_id);
                Ok(())
            }
            Err(e) if is_status(&e, 304) => {
                debug!("Container {} already running", container_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start container {}: {}", container_id, e);
                Err(ContainerError::Docker(e))
            }
        }
    }

    async fn kill_container(&self, container_id: &str) -> Result<bool> {
        let options = KillContainerOptions { signal: "SIGKILL" };

        match self.client.kill_container(container_id, Some(options)).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => {
                debug!("Container {} already gone", container_id);
                Ok(false)
            }
            // 409: exists but is not running
            Err(e) if is_status(&e, 409) => Ok(true),
            Err(e) => Err(ContainerError::Docker(e)),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            v: true,
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => {
                info!("Removed container {}", container_id);
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to remove container {}: {}", container_id, e);
                Err(ContainerError::Docker(e))
            }
        }
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetail> {
        let info = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    ContainerError::NotFound(format!("container {}", container_id))
                } else {
                    ContainerError::Docker(e)
                }
            })?;

        Ok(ContainerDetail {
            id: info.id.unwrap_or_else(|| container_id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            labels: info
                .config
                .and_then(|c| c.labels)
                .map(|l| l.into_iter().collect())
                .unwrap_or_default(),
            running: info.state.and_then(|s| s.running).unwrap_or(false),
            networks: to_networks(info.network_settings.and_then(|s| s.networks)),
        })
    }

    async fn list_containers(
        &self,
        label_filters: &[String],
        include_stopped: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        if !label_filters.is_empty() {
            filters.insert("label".to_string(), label_filters.to_vec());
        }

        let options = ListContainersOptions {
            all: include_stopped,
            filters,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                labels: c.labels.unwrap_or_default().into_iter().collect(),
                networks: to_networks(c.network_settings.and_then(|s| s.networks)),
            })
            .collect())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(ContainerError::Docker(e)),
        }
    }

    async fn load_image(&self, archive: &Path) -> Result<()> {
        info!("Loading image archive {}", archive.display());

        let bytes = tokio::fs::read(archive).await?;
        let mut stream = self.client.import_image(
            ImportImageOptions { quiet: true },
            bytes.into(),
            None,
        );

        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| ContainerError::ImageLoad {
                path: archive.display().to_string(),
                details: e.to_string(),
            })?;
            if let Some(details) = progress.error {
                return Err(ContainerError::ImageLoad {
                    path: archive.display().to_string(),
                    details,
                });
            }
        }

        Ok(())
    }
}
