//! Repair of OS state left behind by crashed or half-finished attempts.

use crate::error::{NetworkError, StepContext, tolerate_absent};
use crate::netns::NetOps;
use crate::network::{host_route, host_rules};
use crate::slot::Slot;

/// Remove anything bearing the slot's names so it can be created from scratch.
///
/// Safe to run on a clean slot any number of times. Runs in the host
/// namespace. Every check runs even when an earlier one fails; callers
/// usually log the error and carry on.
pub fn reap_dangling(ops: &dyn NetOps, slot: &mut Slot, egress: &str) -> Result<(), NetworkError> {
    let idx = slot.idx();
    let mut errors = Vec::new();

    let veth = slot.veth_name();
    let veth_result = match ops.link_exists(&veth).step("probing veth") {
        Ok(true) => {
            tracing::info!(slot = idx, veth = %veth, "Removing dangling veth device");
            tolerate_absent(ops.delete_link(&veth)).step("deleting dangling veth")
        }
        Ok(false) => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = veth_result {
        errors.push(e);
    }

    if slot.clear_network().is_some() {
        tracing::debug!(slot = idx, "Closed stale namespace handle");
    }

    for rule in host_rules(slot, egress) {
        if let Err(e) = tolerate_absent(ops.delete_rule(&rule)).step("deleting dangling host rule") {
            errors.push(e);
        }
    }
    if let Err(e) = tolerate_absent(ops.delete_route(&host_route(slot))).step("deleting dangling host route") {
        errors.push(e);
    }

    let namespace = slot.namespace_id();
    let namespace_result = match ops.namespace_exists(&namespace).step("probing namespace") {
        Ok(true) => {
            tracing::info!(slot = idx, namespace = %namespace, "Removing dangling namespace");
            tolerate_absent(ops.delete_namespace(&namespace)).step("deleting dangling namespace")
        }
        Ok(false) => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = namespace_result {
        errors.push(e);
    }

    for e in &errors {
        tracing::warn!(slot = idx, error = %e, "Dangling resource cleanup step failed");
    }
    NetworkError::from_many(errors)
}
