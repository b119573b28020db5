// ABOUTME: Worker configuration loaded from the environment
// ABOUTME: Storage and image locations, Docker endpoint, CPU pinning, queue size and packet filter binary

use edgenode_config::{
    EDGENODE_COMMAND_QUEUE_CAPACITY, EDGENODE_DEFAULT_CPUSET, EDGENODE_DOCKER_ENDPOINT,
    EDGENODE_IMAGE_DIR, EDGENODE_IPTABLES_BINARY, EDGENODE_WORKLOAD_STORAGE,
};
use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_IMAGE_DIR: &str = "/var/lib/edgenode/images";
pub const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 200;
pub const DEFAULT_IPTABLES_BINARY: &str = "iptables";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid command queue capacity: {0}")]
    InvalidCapacity(#[from] ParseIntError),
    #[error("Command queue capacity must be greater than zero")]
    ZeroCapacity,
    #[error("Workload storage {0} is not a directory")]
    StorageNotDirectory(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub storage_root: PathBuf,
    pub image_dir: PathBuf,
    pub default_cpuset: Option<String>,
    pub docker_endpoint: Option<String>,
    pub command_queue_capacity: usize,
    pub iptables_binary: String,
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl WorkerConfig {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            default_cpuset: None,
            docker_endpoint: None,
            command_queue_capacity: DEFAULT_COMMAND_QUEUE_CAPACITY,
            iptables_binary: DEFAULT_IPTABLES_BINARY.to_string(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let storage_root = non_empty(EDGENODE_WORKLOAD_STORAGE)
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing(EDGENODE_WORKLOAD_STORAGE))?;

        let command_queue_capacity = match non_empty(EDGENODE_COMMAND_QUEUE_CAPACITY) {
            Some(raw) => raw.parse::<usize>()?,
            None => DEFAULT_COMMAND_QUEUE_CAPACITY,
        };
        if command_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        Ok(Self {
            storage_root,
            image_dir: non_empty(EDGENODE_IMAGE_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_DIR)),
            default_cpuset: non_empty(EDGENODE_DEFAULT_CPUSET),
            docker_endpoint: non_empty(EDGENODE_DOCKER_ENDPOINT),
            command_queue_capacity,
            iptables_binary: non_empty(EDGENODE_IPTABLES_BINARY)
                .unwrap_or_else(|| DEFAULT_IPTABLES_BINARY.to_string()),
        })
    }

    /// The storage root must exist before any agreement is configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.storage_root.is_dir() {
            return Err(ConfigError::StorageNotDirectory(self.storage_root.clone()));
        }
        Ok(())
    }
}
