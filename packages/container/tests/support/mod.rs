// ABOUTME: In-memory container runtime and rule table fakes for integration tests
// ABOUTME: Models network membership, address assignment and injected start failures

#![allow(dead_code)]

use async_trait::async_trait;
use edgenode_container::runtime::{
    ContainerDetail, ContainerNetwork, ContainerRuntime, ContainerSpec, ContainerSummary,
    EndpointConfig, NetworkInfo,
};
use edgenode_container::{
    ChainFilter, ContainerError, DeploymentDescription, IsolationRule, Orchestrator, Result,
    RuleTable, RuleTarget,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Debug, Clone)]
pub struct FakeNetwork {
    pub id: String,
    pub name: String,
    pub subnet: usize,
    pub next_host: usize,
    pub containers: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub binds: Vec<String>,
    pub running: bool,
    pub networks: BTreeMap<String, ContainerNetwork>,
}

#[derive(Default)]
struct FakeState {
    networks: BTreeMap<String, FakeNetwork>,
    containers: BTreeMap<String, FakeContainer>,
    images: HashSet<String>,
    archives: Vec<PathBuf>,
    next_id: usize,
    starts: usize,
    fail_start_after: Option<usize>,
    fail_archives: bool,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }

    fn attach(&mut self, container_id: &str, network_id: &str) -> Result<()> {
        let network = self
            .networks
            .get_mut(network_id)
            .ok_or_else(|| ContainerError::NotFound(format!("network {}", network_id)))?;
        network.next_host += 1;
        network.containers.insert(container_id.to_string());
        let address = ContainerNetwork {
            network_id: network.id.clone(),
            ip_address: format!("10.0.{}.{}", network.subnet, network.next_host),
            ip_prefix_len: 24,
        };
        let network_name = network.name.clone();

        let container = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::NotFound(format!("container {}", container_id)))?;
        container.networks.insert(network_name, address);
        Ok(())
    }

    fn find_network(&self, endpoint: &EndpointConfig) -> Option<String> {
        self.networks
            .values()
            .find(|n| n.id == endpoint.network_id || n.name == endpoint.network_name)
            .map(|n| n.id.clone())
    }
}

/// Container runtime keeping everything in memory.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn with_images(images: &[&str]) -> Self {
        let runtime = Self::default();
        runtime.state.lock().unwrap().images = images.iter().map(|i| i.to_string()).collect();
        runtime
    }

    /// Let `n` container starts succeed, fail every later one.
    pub fn fail_start_after(&self, n: usize) {
        self.state.lock().unwrap().fail_start_after = Some(n);
    }

    pub fn fail_archives(&self) {
        self.state.lock().unwrap().fail_archives = true;
    }

    pub fn archives(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().archives.clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .networks
            .values()
            .map(|n| n.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn ip_of(&self, container: &str, network: &str) -> String {
        self.container(container).unwrap().networks[network]
            .ip_address
            .clone()
    }

    /// Names of the containers attached to `network_name`.
    pub fn network_members(&self, network_name: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let Some(network) = state.networks.values().find(|n| n.name == network_name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = network
            .containers
            .iter()
            .filter_map(|id| state.containers.get(id))
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn stop(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.values_mut().find(|c| c.name == name) {
            c.running = false;
        }
    }

    /// Add a running container outside of any network.
    pub fn add_container(&self, name: &str, labels: BTreeMap<String, String>) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("c");
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                labels,
                binds: Vec::new(),
                running: true,
                networks: BTreeMap::new(),
            },
        );
        id
    }
}

fn summary(c: &FakeContainer) -> ContainerSummary {
    ContainerSummary {
        id: c.id.clone(),
        names: vec![format!("/{}", c.name)],
        labels: c.labels.clone(),
        networks: c.networks.clone(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .networks
            .values()
            .map(|n| NetworkInfo {
                id: n.id.clone(),
                name: n.name.clone(),
                containers: Vec::new(),
            })
            .collect())
    }

    async fn inspect_network(&self, network_id: &str) -> Result<NetworkInfo> {
        let state = self.state.lock().unwrap();
        let n = state
            .networks
            .get(network_id)
            .ok_or_else(|| ContainerError::NotFound(format!("network {}", network_id)))?;
        Ok(NetworkInfo {
            id: n.id.clone(),
            name: n.name.clone(),
            containers: n.containers.iter().cloned().collect(),
        })
    }

    async fn create_network(&self, name: &str) -> Result<NetworkInfo> {
        let mut state = self.state.lock().unwrap();
        if state.networks.values().any(|n| n.name == name) {
            return Err(ContainerError::Runtime(format!("network {} exists", name)));
        }
        let id = state.next_id("net");
        let subnet = state.next_id;
        state.networks.insert(
            id.clone(),
            FakeNetwork {
                id: id.clone(),
                name: name.to_string(),
                subnet,
                next_host: 1,
                containers: BTreeSet::new(),
            },
        );
        Ok(NetworkInfo {
            id,
            name: name.to_string(),
            containers: Vec::new(),
        })
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(network) = state.networks.get(network_id) {
            if !network.containers.is_empty() {
                return Err(ContainerError::Runtime(format!(
                    "network {} has active endpoints",
                    network.name
                )));
            }
        }
        state.networks.remove(network_id);
        Ok(())
    }

    async fn connect_network(&self, container_id: &str, endpoint: &EndpointConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let network_id = state
            .find_network(endpoint)
            .ok_or_else(|| ContainerError::NotFound(endpoint.network_name.clone()))?;
        state.attach(container_id, &network_id)
    }

    async fn disconnect_network(&self, network_id: &str, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(network) = state.networks.get_mut(network_id) else {
            return Ok(());
        };
        network.containers.remove(container_id);
        let name = network.name.clone();
        if let Some(c) = state.containers.get_mut(container_id) {
            c.networks.remove(&name);
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(ContainerError::Runtime(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        let network_id = state
            .find_network(&spec.network)
            .ok_or_else(|| ContainerError::NotFound(spec.network.network_name.clone()))?;

        let id = state.next_id("c");
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                labels: spec.config.labels.clone(),
                binds: spec.config.binds.clone(),
                running: false,
                networks: BTreeMap::new(),
            },
        );
        state.attach(&id, &network_id)?;
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        if let Some(limit) = state.fail_start_after {
            if state.starts > limit {
                return Err(ContainerError::Runtime("injected start failure".to_string()));
            }
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(container_id) {
            Some(c) => {
                c.running = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.containers.remove(container_id);
        for network in state.networks.values_mut() {
            network.containers.remove(container_id);
        }
        Ok(())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetail> {
        let state = self.state.lock().unwrap();
        let c = state
            .containers
            .get(container_id)
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))?;
        Ok(ContainerDetail {
            id: c.id.clone(),
            name: c.name.clone(),
            labels: c.labels.clone(),
            running: c.running,
            networks: c.networks.clone(),
        })
    }

    async fn list_containers(
        &self,
        label_filters: &[String],
        include_stopped: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let filters: Vec<(&str, &str)> = label_filters
            .iter()
            .filter_map(|f| f.split_once('='))
            .collect();

        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| include_stopped || c.running)
            .filter(|c| {
                filters
                    .iter()
                    .all(|(k, v)| c.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(summary)
            .collect())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    async fn load_image(&self, archive: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_archives {
            return Err(ContainerError::ImageLoad {
                path: archive.display().to_string(),
                details: "corrupt archive".to_string(),
            });
        }
        state.archives.push(archive.to_path_buf());
        Ok(())
    }
}

/// Rule table keeping chains in memory. `FORWARD` starts with one foreign jump.
pub struct FakeRuleTable {
    chains: Mutex<BTreeMap<String, Vec<IsolationRule>>>,
}

impl FakeRuleTable {
    pub fn new() -> Self {
        let mut chains = BTreeMap::new();
        chains.insert(
            "FORWARD".to_string(),
            vec![IsolationRule::new(RuleTarget::Jump("DOCKER-USER".to_string()))],
        );
        Self {
            chains: Mutex::new(chains),
        }
    }

    pub fn rules(&self, chain: &str) -> Vec<IsolationRule> {
        self.chains
            .lock()
            .unwrap()
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_rules(&self, chain: &str, rules: Vec<IsolationRule>) {
        self.chains.lock().unwrap().insert(chain.to_string(), rules);
    }
}

#[async_trait]
impl RuleTable for FakeRuleTable {
    async fn list_rules(&self, chain: &str) -> Result<Option<Vec<IsolationRule>>> {
        Ok(self.chains.lock().unwrap().get(chain).cloned())
    }

    async fn new_chain(&self, chain: &str) -> Result<()> {
        let mut chains = self.chains.lock().unwrap();
        if chains.contains_key(chain) {
            return Err(ContainerError::PacketFilter(format!("chain {} exists", chain)));
        }
        chains.insert(chain.to_string(), Vec::new());
        Ok(())
    }

    async fn insert_rule(&self, chain: &str, position: usize, rule: &IsolationRule) -> Result<()> {
        let mut chains = self.chains.lock().unwrap();
        let rules = chains
            .get_mut(chain)
            .ok_or_else(|| ContainerError::PacketFilter(format!("no chain {}", chain)))?;
        if position == 0 || position > rules.len() + 1 {
            return Err(ContainerError::PacketFilter(format!(
                "index {} out of range",
                position
            )));
        }
        rules.insert(position - 1, rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, chain: &str, position: usize) -> Result<()> {
        let mut chains = self.chains.lock().unwrap();
        let rules = chains
            .get_mut(chain)
            .ok_or_else(|| ContainerError::PacketFilter(format!("no chain {}", chain)))?;
        if position == 0 || position > rules.len() {
            return Err(ContainerError::PacketFilter(format!(
                "index {} out of range",
                position
            )));
        }
        rules.remove(position - 1);
        Ok(())
    }
}

/// Orchestrator wired to the fakes with a temporary storage root.
pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub rules: Arc<FakeRuleTable>,
    pub orchestrator: Arc<Orchestrator>,
    pub storage: TempDir,
}

impl Harness {
    pub fn new(images: &[&str]) -> Self {
        let storage = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(images));
        let rules = Arc::new(FakeRuleTable::new());
        let filter = Arc::new(ChainFilter::new(rules.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            runtime.clone(),
            filter,
            storage.path(),
            None,
        ));

        Self {
            runtime,
            rules,
            orchestrator,
            storage,
        }
    }

    pub fn storage_dir(&self, agreement_id: &str) -> PathBuf {
        self.storage.path().join(agreement_id)
    }
}

/// Well-formed 64 character hex agreement id.
pub fn agreement(n: u8) -> String {
    format!("{:064x}", n)
}

pub fn env() -> HashMap<String, String> {
    HashMap::from([("HZN_RAM".to_string(), "64".to_string())])
}

pub fn deployment(json: &str) -> DeploymentDescription {
    DeploymentDescription::from_json(json).unwrap()
}

pub const SHARED_GPS: &str = r#"{
    "services": {"gps": {"image": "gps:1"}, "app": {"image": "app:1"}},
    "service_pattern": {"shared": {"singleton": ["gps"]}}
}"#;
