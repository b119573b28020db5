// ABOUTME: Agreement workload orchestration and network isolation for edgenode
// ABOUTME: Turns deployment descriptions into isolated Docker workloads and tears them down again

pub mod config;
pub mod deployment;
pub mod error;
pub mod finalize;
pub mod isolation;
pub mod labels;
pub mod orchestrator;
pub mod pattern;
pub mod runtime;
pub mod worker;

// Re-export commonly used types
pub use config::{ConfigError, WorkerConfig};
pub use deployment::{
    DeploymentDescription, DynamicPermitValue, Encoding, NetworkIsolation, OutboundPermitValue,
    Pattern, Port, Service,
};
pub use error::{ContainerError, CreateFailure, Result};
pub use finalize::{finalize, hash_service, shared_name, RuntimeConfig, ServicePair};
pub use isolation::{
    ChainFilter, IptablesRuleTable, IsolationEngine, IsolationRule, PacketFilter,
    PostCreateContainer, RuleTable, RuleTarget,
};
pub use orchestrator::Orchestrator;
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use worker::{
    AgentEvent, AgreementLaunchContext, CommandHandler, CommandQueue, ContainerWorker,
    WorkerCommand, WorkloadEvent,
};
