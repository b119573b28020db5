// ABOUTME: Builds the comma-separated destination list a container may reach
// ABOUTME: Resolves static permit values and dynamic values looked up in the agreement configuration payload

use serde_json::Value;

use crate::deployment::{DynamicPermitValue, Encoding, NetworkIsolation, OutboundPermitValue};
use crate::runtime::ContainerNetwork;
use crate::{ContainerError, Result};

/// Join every permit value, in declaration order, followed by the container's own `ip/prefix`.
pub fn generate_permitted_string(
    isolation: &NetworkIsolation,
    network: &ContainerNetwork,
    config_payload: &[u8],
) -> Result<String> {
    let mut payload: Option<Value> = None;
    let mut permitted = Vec::new();

    for value in isolation.outbound_permit_only.iter().flatten() {
        match value {
            OutboundPermitValue::Static(address) => permitted.push(address.clone()),
            OutboundPermitValue::Dynamic(dynamic) => {
                if dynamic.encoding != Encoding::Json {
                    return Err(ContainerError::UnsupportedEncoding(dynamic.encoding.to_string()));
                }

                if payload.is_none() {
                    let decoded = serde_json::from_slice(config_payload).map_err(|e| {
                        ContainerError::PermitValue(format!(
                            "configuration payload is not valid JSON: {}",
                            e
                        ))
                    })?;
                    payload = Some(decoded);
                }
                if let Some(decoded) = &payload {
                    permitted.push(resolve(dynamic, decoded)?);
                }
            }
        }
    }

    permitted.push(network.cidr());
    Ok(permitted.join(","))
}

/// Look up `dd_key` in the payload, decode its JSON string, then walk the dot path.
fn resolve(dynamic: &DynamicPermitValue, payload: &Value) -> Result<String> {
    let raw = payload
        .get(&dynamic.dd_key)
        .ok_or_else(|| {
            ContainerError::PermitValue(format!(
                "key {} not found in configuration payload",
                dynamic.dd_key
            ))
        })?
        .as_str()
        .ok_or_else(|| {
            ContainerError::PermitValue(format!(
                "value of {} is not a JSON encoded string",
                dynamic.dd_key
            ))
        })?;

    let decoded: Value = serde_json::from_str(raw).map_err(|e| {
        ContainerError::PermitValue(format!("unable to decode {}: {}", dynamic.dd_key, e))
    })?;

    let mut current = &decoded;
    for segment in dynamic.path.split('.').filter(|s| !s.is_empty()) {
        current = current
            .as_object()
            .and_then(|object| object.get(segment))
            .ok_or_else(|| {
                ContainerError::PermitValue(format!(
                    "path {} not found under {}",
                    dynamic.path, dynamic.dd_key
                ))
            })?;
    }

    match current {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ContainerError::PermitValue(format!(
            "path {} under {} resolves to {}, not an address",
            dynamic.path, dynamic.dd_key, other
        ))),
    }
}
