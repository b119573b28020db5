// ABOUTME: Error types for workload orchestration
// ABOUTME: Covers deployment validation, Docker runtime, packet filter and permit resolution failures

use std::collections::BTreeMap;
use thiserror::Error;

use crate::finalize::RuntimeConfig;

/// Main error type for container orchestration
#[derive(Error, Debug)]
pub enum ContainerError {
    /// Missing or malformed agent-level configuration for an agreement
    #[error("Configuration error: {0}")]
    Config(String),

    /// Deployment description failed validation
    #[error("Invalid deployment description: {0}")]
    InvalidDeployment(String),

    /// Device entry is not of the form host:container
    #[error("Illegal device specified in deployment description: {0}")]
    InvalidDevice(String),

    /// Dynamic permit value uses an encoding other than JSON
    #[error("Unsupported permit value encoding: {0}")]
    UnsupportedEncoding(String),

    /// Dynamic permit value could not be resolved from the configuration payload
    #[error("Unable to resolve permit value: {0}")]
    PermitValue(String),

    /// More than one container matches a shared service identity
    #[error("Shared service identity conflict: {0}")]
    SharedConflict(String),

    /// Docker image not present locally
    #[error("Docker image not found: {0}")]
    ImageNotFound(String),

    /// Image archive could not be loaded
    #[error("Failed to load image archive {path}: {details}")]
    ImageLoad { path: String, details: String },

    /// Docker/container-related errors
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Container runtime reported a failure
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// Container or network not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Packet filter manipulation failed
    #[error("Packet filter error: {0}")]
    PacketFilter(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// True for failures detected before any runtime resource is touched.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ContainerError::Config(_)
                | ContainerError::InvalidDeployment(_)
                | ContainerError::InvalidDevice(_)
                | ContainerError::UnsupportedEncoding(_)
                | ContainerError::Json(_)
        )
    }

    /// True when the runtime reported that the object is already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            ContainerError::NotFound(_) => true,
            ContainerError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => true,
            _ => false,
        }
    }
}

/// Type alias for Results that return ContainerError
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Outcome of a failed agreement creation.
///
/// `partial` holds whatever runtime configuration was finalized before the
/// failure so downstream cleanup knows which services were involved.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct CreateFailure {
    #[source]
    pub error: ContainerError,
    pub partial: BTreeMap<String, RuntimeConfig>,
}
