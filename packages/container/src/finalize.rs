// ABOUTME: Deployment finalizer turning declared services into Docker runtime configuration
// ABOUTME: Validates agreement inputs, computes deployment hashes and builds labels, env, ports and devices

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::deployment::{DeploymentDescription, Service, SINGLETON};
use crate::labels;
use crate::{ContainerError, Result};

/// Mount point of the read-only workload storage inside every container.
pub const WORKLOAD_CONFIG_MOUNT: &str = "/workload_config";

/// Log driver used for all workload containers.
pub const LOG_DRIVER: &str = "syslog";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBinding {
    pub host_ip: String,
    /// Empty means the runtime picks a free host port.
    pub host_port: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
}

/// Workload containers are always restarted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub driver: String,
    pub tag: String,
}

/// Runtime configuration derived from one declared service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub cpuset: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<String>,
    pub port_bindings: BTreeMap<String, Vec<HostBinding>>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub memory_bytes: i64,
    pub devices: Vec<DeviceMapping>,
    pub binds: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub log_config: LogConfig,
}

impl RuntimeConfig {
    pub fn deployment_hash(&self) -> Option<&str> {
        labels::get(&self.labels, labels::DEPLOYMENT_HASH)
    }

    pub fn is_singleton(&self) -> bool {
        labels::is_singleton(&self.labels)
    }
}

/// A declared service paired with the runtime configuration built from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePair {
    pub service: Service,
    pub config: RuntimeConfig,
    /// Host directory bound read-only at [`WORKLOAD_CONFIG_MOUNT`].
    pub storage_dir: PathBuf,
}

/// SHA-1 over the JSON encoding of a service, base64url encoded.
pub fn hash_service(service: &Service) -> Result<String> {
    let encoded = serde_json::to_vec(service)?;
    debug!("Hashing service: {}", String::from_utf8_lossy(&encoded));

    let digest = Sha1::digest(&encoded);
    Ok(URL_SAFE.encode(digest))
}

/// Memory limit for the agreement in bytes, from the `HZN_RAM` megabyte value.
fn memory_limit(agreement_id: &str, environment_additions: &HashMap<String, String>) -> Result<i64> {
    let var = edgenode_config::ram_var();
    let ram = environment_additions.get(&var).ok_or_else(|| {
        ContainerError::Config(format!(
            "Missing required environment var {} for agreement: {}",
            var, agreement_id
        ))
    })?;

    let megabytes: i64 = ram.trim().parse().map_err(|e| {
        ContainerError::Config(format!("Unable to parse {}={} as megabytes: {}", var, ram, e))
    })?;

    if megabytes < 0 {
        return Err(ContainerError::Config(format!(
            "{} must not be negative, got {}",
            var, megabytes
        )));
    }

    megabytes
        .checked_mul(1024 * 1024)
        .ok_or_else(|| ContainerError::Config(format!("{}={} overflows", var, megabytes)))
}

fn is_redacted(entry: &str) -> bool {
    let key = entry.split('=').next().unwrap_or_default();
    edgenode_config::ethereum_account_vars()
        .iter()
        .any(|redacted| redacted == key)
}

/// Name shared by a singleton service's container, bridge network and storage dir.
pub fn shared_name(service_name: &str, variation: &str) -> String {
    if variation.is_empty() {
        format!("{}-{}", SINGLETON, service_name)
    } else {
        format!("{}-{}-{}", SINGLETON, service_name, variation)
    }
}

fn log_tag(agreement_id: &str, service_name: &str, service: &Service, shared: bool) -> String {
    if shared {
        if service.variation_label.is_empty() {
            format!("workload-{}_{}", SINGLETON, service_name)
        } else {
            format!(
                "workload-{}_{}-{}",
                SINGLETON, service_name, service.variation_label
            )
        }
    } else {
        format!("workload-{}_{}", agreement_id.to_lowercase(), service_name)
    }
}

/// Build one [`ServicePair`] per declared service.
///
/// Private services get `<storage_root>/<agreement_id>` as their storage,
/// shared ones a directory named after the singleton so it outlives the agreement.
/// Pure construction: nothing is created on the host here.
pub fn finalize(
    agreement_id: &str,
    deployment: &DeploymentDescription,
    environment_additions: &HashMap<String, String>,
    storage_root: &Path,
    cpuset: Option<&str>,
) -> Result<BTreeMap<String, ServicePair>> {
    let memory_bytes = memory_limit(agreement_id, environment_additions)?;

    if deployment.services.is_empty() {
        return Err(ContainerError::InvalidDeployment(format!(
            "No services specified in deployment for agreement: {}",
            agreement_id
        )));
    }

    // global additions go first, in a stable order
    let mut additions: Vec<(&String, &String)> = environment_additions.iter().collect();
    additions.sort();

    let mut pairs = BTreeMap::new();

    for (service_name, service) in &deployment.services {
        let deployment_hash = hash_service(service)?;
        let shared = deployment.is_shared(service_name);
        let storage_dir = if shared {
            storage_root.join(shared_name(service_name, &service.variation_label))
        } else {
            storage_root.join(agreement_id)
        };

        let mut labels = BTreeMap::new();
        labels.insert(labels::key(labels::SERVICE_NAME), service_name.clone());
        labels.insert(labels::key(labels::VARIATION), service.variation_label.clone());
        labels.insert(labels::key(labels::DEPLOYMENT_HASH), deployment_hash);
        if shared {
            labels.insert(labels::key(labels::SHARED_PATTERN), SINGLETON.to_string());
        } else {
            labels.insert(labels::key(labels::AGREEMENT_ID), agreement_id.to_string());
        }

        let mut env: Vec<String> = additions
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.extend(
            service
                .environment
                .iter()
                .filter(|entry| !is_redacted(entry))
                .cloned(),
        );

        let mut exposed_ports = BTreeSet::new();
        let mut port_bindings = BTreeMap::new();
        for port in &service.ports {
            if port.port_and_protocol.is_empty() {
                return Err(ContainerError::InvalidDeployment(format!(
                    "Failed to locate necessary port setup param, port_and_protocol in service {}",
                    service_name
                )));
            }

            let host_ip = if port.localhost_only {
                "127.0.0.1"
            } else {
                "0.0.0.0"
            };

            exposed_ports.insert(port.port_and_protocol.clone());
            port_bindings.insert(
                port.port_and_protocol.clone(),
                vec![HostBinding {
                    host_ip: host_ip.to_string(),
                    host_port: String::new(),
                }],
            );
        }

        let mut devices = Vec::with_capacity(service.devices.len());
        for device in &service.devices {
            match device.split(':').collect::<Vec<_>>().as_slice() {
                [host, container] => devices.push(DeviceMapping {
                    path_on_host: host.to_string(),
                    path_in_container: container.to_string(),
                }),
                _ => return Err(ContainerError::InvalidDevice(device.clone())),
            }
        }

        let config = RuntimeConfig {
            image: service.image.clone(),
            env,
            cmd: service.command.clone(),
            cpuset: cpuset.map(str::to_string),
            labels,
            exposed_ports,
            port_bindings,
            privileged: service.privileged,
            cap_add: service.cap_add.clone(),
            memory_bytes,
            devices,
            binds: vec![format!(
                "{}:{}:ro",
                storage_dir.display(),
                WORKLOAD_CONFIG_MOUNT
            )],
            restart_policy: RestartPolicy::Always,
            log_config: LogConfig {
                driver: LOG_DRIVER.to_string(),
                tag: log_tag(agreement_id, service_name, service, shared),
            },
        };

        pairs.insert(
            service_name.clone(),
            ServicePair {
                service: service.clone(),
                config,
                storage_dir,
            },
        );
    }

    Ok(pairs)
}
