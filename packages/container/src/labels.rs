// ABOUTME: Docker label keys identifying edgenode workload containers
// ABOUTME: Builds label keys and label filters used for shared service discovery and teardown

use std::collections::BTreeMap;

/// Prefix applied to every label edgenode puts on a container.
pub const LABEL_PREFIX: &str = "io.edgenode.workload";

pub const AGREEMENT_ID: &str = "agreement_id";
pub const SERVICE_NAME: &str = "service_name";
pub const VARIATION: &str = "variation";
pub const DEPLOYMENT_HASH: &str = "deployment_description_hash";
pub const SHARED_PATTERN: &str = "service_pattern.shared";

/// Fully qualified label key, e.g. `io.edgenode.workload.agreement_id`.
pub fn key(name: &str) -> String {
    format!("{}.{}", LABEL_PREFIX, name)
}

/// `key=value` filter expression understood by the container runtime.
pub fn filter(name: &str, value: &str) -> String {
    format!("{}={}", key(name), value)
}

pub fn get<'a>(labels: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    labels.get(&key(name)).map(String::as_str)
}

pub fn agreement_id(labels: &BTreeMap<String, String>) -> Option<&str> {
    get(labels, AGREEMENT_ID).filter(|id| !id.is_empty())
}

pub fn service_name(labels: &BTreeMap<String, String>) -> Option<&str> {
    get(labels, SERVICE_NAME)
}

pub fn is_singleton(labels: &BTreeMap<String, String>) -> bool {
    get(labels, SHARED_PATTERN) == Some(crate::deployment::SINGLETON)
}
