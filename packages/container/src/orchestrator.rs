// ABOUTME: Agreement workload lifecycle: create with rollback, reference-counted teardown, maintenance
// ABOUTME: Wires shared singleton and private containers onto bridge networks and installs isolation rules

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::deployment::{DeploymentDescription, Service, SINGLETON};
use crate::finalize::{self, shared_name, RuntimeConfig, ServicePair};
use crate::isolation::{IsolationEngine, PacketFilter, PostCreateContainer};
use crate::labels;
use crate::pattern;
use crate::runtime::{
    ContainerDetail, ContainerRuntime, ContainerSpec, ContainerSummary, EndpointConfig,
    NetworkInfo,
};
use crate::{ContainerError, CreateFailure, Result};

/// File the raw configuration payload is written to inside the agreement storage dir.
pub const CONFIGURE_FILE: &str = "Configure";

/// Minimum length of a well-formed agreement id.
const AGREEMENT_ID_MIN_LEN: usize = 64;

/// Agreement ids are long hex strings; anything else was not created by us.
pub fn is_agreement_id(id: &str) -> bool {
    id.len() >= AGREEMENT_ID_MIN_LEN && id.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    isolation: IsolationEngine,
    storage_root: PathBuf,
    cpuset: Option<String>,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        filter: Arc<dyn PacketFilter>,
        storage_root: impl Into<PathBuf>,
        cpuset: Option<String>,
    ) -> Self {
        Self {
            runtime,
            isolation: IsolationEngine::new(filter),
            storage_root: storage_root.into(),
            cpuset,
        }
    }

    pub fn storage_dir(&self, agreement_id: &str) -> PathBuf {
        self.storage_root.join(agreement_id)
    }

    /// Create every resource of an agreement.
    ///
    /// On failure everything created for `agreement_id` is torn down before
    /// returning; the original error is reported, rollback errors are only logged.
    pub async fn create(
        &self,
        agreement_id: &str,
        deployment: &DeploymentDescription,
        environment_additions: &HashMap<String, String>,
        config_payload: &[u8],
    ) -> std::result::Result<BTreeMap<String, RuntimeConfig>, CreateFailure> {
        let storage_dir = self.storage_dir(agreement_id);

        // nothing of ours exists yet if this fails, so there is nothing to roll back
        if let Err(error) = self.prepare_storage(&storage_dir, config_payload).await {
            error!(
                "Unable to prepare storage {} for agreement {}: {}",
                storage_dir.display(),
                agreement_id,
                error
            );
            return Err(CreateFailure {
                error,
                partial: BTreeMap::new(),
            });
        }

        let pairs = match finalize::finalize(
            agreement_id,
            deployment,
            environment_additions,
            &self.storage_root,
            self.cpuset.as_deref(),
        ) {
            Ok(pairs) => pairs,
            Err(error) => return Err(self.rollback(agreement_id, error, BTreeMap::new()).await),
        };

        let configs: BTreeMap<String, RuntimeConfig> = pairs
            .iter()
            .map(|(name, pair)| (name.clone(), pair.config.clone()))
            .collect();

        match self
            .start_services(agreement_id, deployment, pairs, environment_additions, config_payload)
            .await
        {
            Ok(()) => {
                for name in configs.keys() {
                    info!("Created service {} in agreement {}", name, agreement_id);
                }
                Ok(configs)
            }
            Err(error) => Err(self.rollback(agreement_id, error, configs).await),
        }
    }

    /// Create the agreement's storage dir and persist the raw configuration in it.
    ///
    /// An existing dir belongs to a live agreement and is left alone; a dir
    /// created here is removed again when the write fails.
    async fn prepare_storage(&self, storage_dir: &Path, config_payload: &[u8]) -> Result<()> {
        tokio::fs::create_dir(storage_dir).await?;
        debug!("Writing raw configuration to {}", storage_dir.display());

        if let Err(e) = tokio::fs::write(storage_dir.join(CONFIGURE_FILE), config_payload).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(storage_dir).await {
                error!(
                    "Failed to remove storage {} after write error: {}",
                    storage_dir.display(),
                    cleanup
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Storage of a singleton service; reused when left over from an earlier instance.
    async fn prepare_shared_storage(&self, storage_dir: &Path, config_payload: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(storage_dir).await?;
        debug!("Writing raw configuration to {}", storage_dir.display());
        tokio::fs::write(storage_dir.join(CONFIGURE_FILE), config_payload).await?;
        Ok(())
    }

    async fn remove_storage(&self, dir: &Path) {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!("Removed storage {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!("Failed to remove storage {}: {}", dir.display(), e),
        }
    }

    async fn rollback(
        &self,
        agreement_id: &str,
        error: ContainerError,
        partial: BTreeMap<String, RuntimeConfig>,
    ) -> CreateFailure {
        error!(
            "Failed to set up agreement {}, removing its resources: {}",
            agreement_id, error
        );

        if let Err(rollback) = self.remove(&[agreement_id.to_string()]).await {
            error!(
                "Failed to clean up resources of agreement {} after setup error: {}",
                agreement_id, rollback
            );
        }

        CreateFailure { error, partial }
    }

    async fn start_services(
        &self,
        agreement_id: &str,
        deployment: &DeploymentDescription,
        pairs: BTreeMap<String, ServicePair>,
        environment_additions: &HashMap<String, String>,
        config_payload: &[u8],
    ) -> Result<()> {
        for pair in pairs.values() {
            if !self.runtime.image_exists(&pair.config.image).await? {
                return Err(ContainerError::ImageNotFound(pair.config.image.clone()));
            }
        }

        let services: BTreeMap<String, Service> = pairs
            .iter()
            .map(|(name, pair)| (name.clone(), pair.service.clone()))
            .collect();
        let (shared, private) = pattern::classify(pairs, &deployment.service_pattern);

        let mut post_create = Vec::new();
        let mut shared_endpoints: BTreeMap<String, EndpointConfig> = BTreeMap::new();

        for (service_name, pair) in &shared {
            let bridge_name = shared_name(service_name, &pair.service.variation_label);
            let (network, container) = self
                .resolve_shared(service_name, pair, &bridge_name, SINGLETON)
                .await?;

            let network = match network {
                Some(network) => network,
                None => {
                    info!("Creating network {} for shared service {}", bridge_name, service_name);
                    self.runtime.create_network(&bridge_name).await?
                }
            };

            shared_endpoints.insert(
                network.name.clone(),
                EndpointConfig {
                    network_id: network.id.clone(),
                    network_name: network.name.clone(),
                    aliases: Vec::new(),
                },
            );

            match container {
                Some(existing) => {
                    info!(
                        "Reusing shared service {} container {} for agreement {}",
                        service_name, existing.id, agreement_id
                    );
                    post_create.push(PostCreateContainer::Existing(existing));
                }
                None => {
                    self.prepare_shared_storage(&pair.storage_dir, config_payload)
                        .await?;
                    let detail = self
                        .start_service(&bridge_name, service_name, pair, &network, &[])
                        .await?;
                    post_create.push(PostCreateContainer::New(detail));
                }
            }
        }

        let bridge = self.runtime.create_network(agreement_id).await?;
        let extra: Vec<EndpointConfig> = shared_endpoints.into_values().collect();

        for (service_name, pair) in &private {
            let name = format!("{}-{}", agreement_id, service_name);
            let detail = self
                .start_service(&name, service_name, pair, &bridge, &extra)
                .await?;
            post_create.push(PostCreateContainer::New(detail));
        }

        self.isolation
            .apply(
                agreement_id,
                &post_create,
                &services,
                environment_additions,
                config_payload,
            )
            .await
    }

    /// Create and start one container on `network`, then attach it to `extra` networks.
    async fn start_service(
        &self,
        container_name: &str,
        service_name: &str,
        pair: &ServicePair,
        network: &NetworkInfo,
        extra: &[EndpointConfig],
    ) -> Result<ContainerDetail> {
        let spec = ContainerSpec {
            name: container_name.to_string(),
            config: pair.config.clone(),
            network: EndpointConfig {
                network_id: network.id.clone(),
                network_name: network.name.clone(),
                aliases: vec![service_name.to_string()],
            },
        };

        let id = self.runtime.create_container(&spec).await?;
        self.runtime.start_container(&id).await?;

        for endpoint in extra {
            self.runtime.connect_network(&id, endpoint).await?;
        }

        debug!("Started container {} ({})", container_name, id);
        self.runtime.inspect_container(&id).await
    }

    /// Find an already running instance of a shared service and its bridge.
    ///
    /// More than one container matching the service identity is an error, as
    /// is a matching container whose bridge network is gone.
    pub async fn resolve_shared(
        &self,
        service_name: &str,
        pair: &ServicePair,
        bridge_name: &str,
        share_label: &str,
    ) -> Result<(Option<NetworkInfo>, Option<ContainerSummary>)> {
        let network = self
            .runtime
            .list_networks()
            .await?
            .into_iter()
            .find(|n| n.name == bridge_name);

        let hash = pair.config.deployment_hash().ok_or_else(|| {
            ContainerError::InvalidDeployment(format!(
                "service {} has no deployment hash",
                service_name
            ))
        })?;

        let filters = vec![
            labels::filter(labels::SERVICE_NAME, service_name),
            labels::filter(labels::VARIATION, &pair.service.variation_label),
            labels::filter(labels::DEPLOYMENT_HASH, hash),
            labels::filter(labels::SHARED_PATTERN, share_label),
        ];
        let mut containers = self.runtime.list_containers(&filters, false).await?;

        if containers.len() > 1 {
            let ids: Vec<&str> = containers.iter().map(|c| c.id.as_str()).collect();
            return Err(ContainerError::SharedConflict(format!(
                "more than one container matches shared service {} ({}): {:?}",
                service_name, hash, ids
            )));
        }

        match (network, containers.pop()) {
            (Some(network), container) => {
                debug!(
                    "Found network {} for shared service {}, container present: {}",
                    network.name,
                    service_name,
                    container.is_some()
                );
                Ok((Some(network), container))
            }
            (None, Some(container)) => Err(ContainerError::SharedConflict(format!(
                "shared service {} container {} is running without network {}",
                service_name, container.id, bridge_name
            ))),
            (None, None) => Ok((None, None)),
        }
    }

    /// Tear down the resources of `agreement_ids`. Safe to call repeatedly.
    ///
    /// Shared containers survive while any container of another agreement is
    /// attached to their bridge.
    pub async fn remove(&self, agreement_ids: &[String]) -> Result<()> {
        info!("Removing resources of agreements {:?}", agreement_ids);
        let removing: HashSet<&str> = agreement_ids.iter().map(String::as_str).collect();

        for agreement_id in agreement_ids {
            self.remove_storage(&self.storage_dir(agreement_id)).await;
        }

        let networks = self.runtime.list_networks().await?;
        let containers = self.runtime.list_containers(&[], true).await?;
        let mut free_networks: Vec<NetworkInfo> = Vec::new();
        let mut kept_shared: BTreeSet<String> = BTreeSet::new();
        let mut freed_shared: BTreeSet<String> = BTreeSet::new();
        let mut failures = 0;

        for container in &containers {
            let owned = container
                .agreement_id()
                .is_some_and(|id| removing.contains(id));
            if !owned && !container.is_singleton() {
                continue;
            }

            if container.is_singleton() {
                let storage_name = shared_name(
                    container.service_name().unwrap_or_default(),
                    labels::get(&container.labels, labels::VARIATION).unwrap_or_default(),
                );
                let network = networks
                    .iter()
                    .find(|n| container.networks.contains_key(&n.name) && container.has_name(&n.name));

                if let Some(network) = network {
                    if self.shared_in_use(network, &containers, &removing).await? {
                        debug!(
                            "Keeping shared container {:?}, still referenced by other agreements",
                            container.names
                        );
                        kept_shared.insert(storage_name);
                        continue;
                    }
                    free_networks.push(network.clone());
                } else {
                    warn!("No network found for shared container {:?}", container.names);
                }

                if let Err(e) = self.destroy(container).await {
                    error!("Unable to remove container {:?}: {}", container.names, e);
                    failures += 1;
                    kept_shared.insert(storage_name);
                } else {
                    freed_shared.insert(storage_name);
                }
                continue;
            }

            if let Err(e) = self.destroy(container).await {
                error!("Unable to remove container {:?}: {}", container.names, e);
                failures += 1;
            }
        }

        // storage of a singleton goes with its last instance
        for name in freed_shared.difference(&kept_shared) {
            self.remove_storage(&self.storage_dir(name)).await;
        }

        for network in networks.iter().filter(|n| removing.contains(n.name.as_str())) {
            match self.runtime.inspect_network(&network.id).await {
                Ok(detail) => {
                    for container_id in &detail.containers {
                        debug!("Disconnecting {} from {}", container_id, network.name);
                        if let Err(e) = self
                            .runtime
                            .disconnect_network(&network.id, container_id)
                            .await
                        {
                            error!(
                                "Failed to disconnect {} from {}: {}",
                                container_id, network.name, e
                            );
                        }
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => error!("Unable to inspect network {}: {}", network.name, e),
            }
            free_networks.push(network.clone());
        }

        for network in &free_networks {
            if let Err(e) = self.runtime.remove_network(&network.id).await {
                error!("Failed to remove network {}: {}", network.name, e);
            }
        }

        for agreement_id in agreement_ids {
            self.isolation.purge(agreement_id).await?;
        }

        if failures > 0 {
            return Err(ContainerError::Runtime(format!(
                "{} containers of agreements {:?} could not be removed",
                failures, agreement_ids
            )));
        }
        Ok(())
    }

    async fn shared_in_use(
        &self,
        network: &NetworkInfo,
        containers: &[ContainerSummary],
        removing: &HashSet<&str>,
    ) -> Result<bool> {
        let attached = match self.runtime.inspect_network(&network.id).await {
            Ok(detail) => detail.containers,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        Ok(containers
            .iter()
            .filter(|c| attached.contains(&c.id))
            .filter_map(ContainerSummary::agreement_id)
            .any(|id| !removing.contains(id)))
    }

    async fn destroy(&self, container: &ContainerSummary) -> Result<()> {
        let service = container.service_name().unwrap_or_default();

        if !self.runtime.kill_container(&container.id).await? {
            debug!("Service {} container {} already gone", service, container.id);
            return Ok(());
        }

        self.runtime.remove_container(&container.id).await?;
        info!("Service {} container {} stopped and removed", service, container.id);
        Ok(())
    }

    /// Number of running containers serving the services of `deployment` for an agreement.
    ///
    /// `deployment` is the runtime configuration reported when the agreement
    /// started; singleton entries are matched against the shared containers.
    pub async fn running_count(
        &self,
        agreement_id: &str,
        deployment: &BTreeMap<String, RuntimeConfig>,
    ) -> Result<usize> {
        let private = self
            .runtime
            .list_containers(&[labels::filter(labels::AGREEMENT_ID, agreement_id)], false)
            .await?;
        let shared = self
            .runtime
            .list_containers(&[labels::filter(labels::SHARED_PATTERN, SINGLETON)], false)
            .await?;

        let expected = |container: &ContainerSummary, singleton: bool| {
            container
                .service_name()
                .and_then(|name| deployment.get(name))
                .is_some_and(|config| config.is_singleton() == singleton)
        };

        Ok(private.iter().filter(|c| expected(*c, false)).count()
            + shared.iter().filter(|c| expected(*c, true)).count())
    }

    /// Remove leftovers of agreements not in `known`. Returns the agreement ids cleaned up.
    pub async fn sync_up_resources(&self, known: &HashSet<String>) -> Result<Vec<String>> {
        info!("Syncing container resources with {} known agreements", known.len());
        let mut leftovers = BTreeSet::new();

        for container in self.runtime.list_containers(&[], true).await? {
            // shared containers are reclaimed through reference counting
            if container.is_singleton() {
                continue;
            }
            if let Some(id) = container.agreement_id() {
                if is_agreement_id(id) && !known.contains(id) {
                    debug!("Found leftover container {:?} of {}", container.names, id);
                    leftovers.insert(id.to_string());
                }
            }
        }

        for network in self.runtime.list_networks().await? {
            if is_agreement_id(&network.name) && !known.contains(&network.name) {
                debug!("Found leftover network {}", network.name);
                leftovers.insert(network.name);
            }
        }

        let leftovers: Vec<String> = leftovers.into_iter().collect();
        if !leftovers.is_empty() {
            info!("Removing leftover agreements {:?}", leftovers);
            self.remove(&leftovers).await?;
        }
        Ok(leftovers)
    }

    /// Load image archives into the local image store, stopping at the first failure.
    pub async fn load_images(&self, archives: &[PathBuf]) -> Result<()> {
        for archive in archives {
            self.runtime.load_image(archive).await?;
        }
        Ok(())
    }
}
