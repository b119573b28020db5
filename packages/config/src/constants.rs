// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across edgenode

// Workload Storage
pub const EDGENODE_WORKLOAD_STORAGE: &str = "EDGENODE_WORKLOAD_STORAGE";
pub const EDGENODE_IMAGE_DIR: &str = "EDGENODE_IMAGE_DIR";

// Container Runtime
pub const EDGENODE_DOCKER_ENDPOINT: &str = "EDGENODE_DOCKER_ENDPOINT";
pub const EDGENODE_DEFAULT_CPUSET: &str = "EDGENODE_DEFAULT_CPUSET";

// Command Processing
pub const EDGENODE_COMMAND_QUEUE_CAPACITY: &str = "EDGENODE_COMMAND_QUEUE_CAPACITY";

// Packet Filter
pub const EDGENODE_IPTABLES_BINARY: &str = "EDGENODE_IPTABLES_BINARY";

// Agreement Environment Additions
//
// Prefixes of the variables injected into every workload container. The
// compat prefix is only honoured where older agents still send it.
pub const ENVVAR_PREFIX: &str = "HZN_";
pub const COMPAT_ENVVAR_PREFIX: &str = "MTN_";

/// Suffix of the per-agreement memory limit variable, in megabytes.
pub const RAM_SUFFIX: &str = "RAM";

/// Suffix of the legacy blockchain account variable.
pub const ETHEREUM_ACCOUNT_SUFFIX: &str = "ETHEREUM_ACCOUNT";

/// `HZN_RAM`
pub fn ram_var() -> String {
    format!("{}{}", ENVVAR_PREFIX, RAM_SUFFIX)
}

/// `HZN_ETHEREUM_ACCOUNT`
pub fn ethereum_account_var() -> String {
    format!("{}{}", ENVVAR_PREFIX, ETHEREUM_ACCOUNT_SUFFIX)
}

/// Every prefixed spelling of the legacy blockchain account variable.
pub fn ethereum_account_vars() -> [String; 2] {
    [
        format!("{}{}", ENVVAR_PREFIX, ETHEREUM_ACCOUNT_SUFFIX),
        format!("{}{}", COMPAT_ENVVAR_PREFIX, ETHEREUM_ACCOUNT_SUFFIX),
    ]
}
