// ABOUTME: Deployment description wire model for agreement workloads
// ABOUTME: Services, shared service patterns, ports and network isolation permit values

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ContainerError, Result};

/// Pattern type marking a service as one instance shared by every agreement.
pub const SINGLETON: &str = "singleton";

/// Signed, declarative description of the services to run for one agreement.
///
/// ```json
/// {
///   "services": {
///     "svc_b": {
///       "image": "...",
///       "network_isolation": {
///         "outbound_permit_only_ignore": "ETH_ACCT_SPECIFIED",
///         "outbound_permit_only": [
///           "4.2.2.2",
///           { "dd_key": "deployment_user_info", "encoding": "JSON", "path": "broker.host" }
///         ]
///       }
///     }
///   },
///   "service_pattern": { "shared": { "singleton": ["svc_b"] } }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDescription {
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    #[serde(default)]
    pub service_pattern: Pattern,
}

impl DeploymentDescription {
    /// Parse a deployment description from its JSON wire form.
    pub fn from_json(deployment: &str) -> Result<Self> {
        serde_json::from_str(deployment).map_err(|e| {
            ContainerError::InvalidDeployment(format!(
                "error unmarshalling deployment config as DeploymentDescription: {}",
                e
            ))
        })
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn is_shared(&self, service_name: &str) -> bool {
        self.service_pattern.is_shared(SINGLETON, service_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(default)]
    pub shared: BTreeMap<String, Vec<String>>,
}

impl Pattern {
    pub fn is_shared(&self, pattern_type: &str, service_name: &str) -> bool {
        self.shared
            .get(pattern_type)
            .map(|names| names.iter().any(|n| n == service_name))
            .unwrap_or(false)
    }
}

/// One declared service. Field order is part of the deployment hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variation_label: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_isolation: Option<NetworkIsolation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Port {
    #[serde(default)]
    pub localhost_only: bool,
    #[serde(default)]
    pub port_and_protocol: String,
}

/// Condition under which a service's isolation policy is skipped entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundPermitOnlyIgnore {
    /// Skip when the agreement configured a blockchain account.
    #[serde(rename = "ETH_ACCT_SPECIFIED")]
    EthAcctSpecified,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkIsolation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_permit_only_ignore: Option<OutboundPermitOnlyIgnore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_permit_only: Option<Vec<OutboundPermitValue>>,
}

impl NetworkIsolation {
    pub fn ignores_when_account_specified(&self) -> bool {
        self.outbound_permit_only_ignore == Some(OutboundPermitOnlyIgnore::EthAcctSpecified)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    #[serde(rename = "JSON")]
    Json,
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encoding::Json => write!(f, "JSON"),
            Encoding::Other(other) => write!(f, "{}", other),
        }
    }
}

/// Permit value looked up in the agreement's configuration payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicPermitValue {
    pub dd_key: String,
    pub encoding: Encoding,
    #[serde(default)]
    pub path: String,
}

/// Allowed outbound destination: a literal address or a payload lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundPermitValue {
    Static(String),
    Dynamic(DynamicPermitValue),
}

impl<'de> Deserialize<'de> for OutboundPermitValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;

        // an object carrying dd_key is dynamic; anything else must be a plain string
        if raw.get("dd_key").is_some() {
            return serde_json::from_value(raw)
                .map(OutboundPermitValue::Dynamic)
                .map_err(de::Error::custom);
        }

        match raw {
            serde_json::Value::String(s) => Ok(OutboundPermitValue::Static(s)),
            other => Err(de::Error::custom(format!(
                "outbound permit value must be a string or an object with dd_key, found {}",
                other
            ))),
        }
    }
}
