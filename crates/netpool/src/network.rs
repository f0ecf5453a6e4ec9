//! Creation and teardown of a slot's network resources.
//!
//! Both sequences switch namespaces and must run on the namespace worker.

use crate::error::{NetworkError, StepContext, tolerate_absent};
use crate::firewall;
use crate::netns::{NamespaceGuard, NetOps, Route, Rule, Table};
use crate::slot::{Ipv4Cidr, Slot, VRT_PREFIX};

const LOOPBACK: &str = "lo";

/// Forwarding and masquerade rules installed in the host namespace.
pub(crate) fn host_rules(slot: &Slot, egress: &str) -> [Rule; 3] {
    let veth = slot.veth_name();
    let host_cidr = slot.host_cidr();
    [
        Rule::new(
            Table::Filter,
            "FORWARD",
            ["-i", veth.as_str(), "-o", egress, "-j", "ACCEPT"],
        ),
        Rule::new(
            Table::Filter,
            "FORWARD",
            ["-i", egress, "-o", veth.as_str(), "-j", "ACCEPT"],
        ),
        Rule::new(
            Table::Nat,
            "POSTROUTING",
            ["-s", host_cidr.as_str(), "-o", egress, "-j", "MASQUERADE"],
        ),
    ]
}

/// Host route to the sandbox's host-visible address.
pub(crate) fn host_route(slot: &Slot) -> Route {
    Route::to(slot.host_net(), slot.vpeer_ip())
}

/// Address translation between the guest and its host-visible address.
fn namespace_nat_rules(slot: &Slot) -> [Rule; 2] {
    let vpeer = slot.vpeer_name();
    let host_ip = slot.host_ip_string();
    let guest_ip = slot.namespace_ip().to_string();
    [
        Rule::new(
            Table::Nat,
            "POSTROUTING",
            [
                "-o",
                vpeer.as_str(),
                "-s",
                guest_ip.as_str(),
                "-j",
                "SNAT",
                "--to-source",
                host_ip.as_str(),
            ],
        ),
        Rule::new(
            Table::Nat,
            "PREROUTING",
            [
                "-d",
                host_ip.as_str(),
                "-j",
                "DNAT",
                "--to-destination",
                guest_ip.as_str(),
            ],
        ),
    ]
}

/// Enter the slot's namespace, by handle when held and by name otherwise.
///
/// The returned guard switches back when dropped.
pub(crate) fn enter_slot_namespace<'a>(
    ops: &'a dyn NetOps,
    slot: &Slot,
) -> Result<NamespaceGuard<'a>, NetworkError> {
    let guard = NamespaceGuard::capture(ops)?;
    match slot.namespace() {
        Some(handle) => ops.enter_namespace(handle)?,
        None => {
            let handle = ops.open_namespace(&slot.namespace_id())?;
            ops.enter_namespace(&handle)?;
        }
    }
    Ok(guard)
}

/// Build the slot's namespace, links, routes, NAT and firewall.
///
/// The calling thread ends in the namespace it started in on every path. On
/// failure, whatever was created is left for the reaper and the identity is
/// still held.
pub fn create_network(ops: &dyn NetOps, slot: &mut Slot, egress: &str) -> Result<(), NetworkError> {
    let idx = slot.idx();
    tracing::debug!(slot = idx, namespace = %slot.namespace_id(), "Creating slot network");

    let host = NamespaceGuard::capture(ops).step("capturing host namespace")?;

    let handle = ops
        .create_namespace(&slot.namespace_id())
        .step("creating namespace")?;
    slot.attach_namespace(handle);

    let veth = slot.veth_name();
    let vpeer = slot.vpeer_name();
    ops.add_veth_pair(&veth, &vpeer)
        .step("creating veth pair")?;
    ops.set_link_up(&vpeer).step("setting vpeer up")?;
    ops.add_address(&vpeer, Ipv4Cidr::new(slot.vpeer_ip(), VRT_PREFIX))
        .step("adding vpeer address")?;
    ops.move_link(&veth, host.origin())
        .step("moving veth to host namespace")?;

    host.return_to_origin().step("entering host namespace")?;
    ops.set_link_up(&veth).step("setting veth up")?;
    ops.add_address(&veth, Ipv4Cidr::new(slot.veth_ip(), VRT_PREFIX))
        .step("adding veth address")?;

    {
        let namespace = slot
            .namespace()
            .ok_or_else(|| NetworkError::NotFound(slot.namespace_id()))
            .step("reading namespace handle")?;
        ops.enter_namespace(namespace)
            .step("entering slot namespace")?;
    }

    let tap = slot.tap_name();
    ops.add_tap(&tap).step("creating tap device")?;
    ops.set_link_up(&tap).step("setting tap up")?;
    ops.add_address(&tap, slot.tap_cidr())
        .step("adding tap address")?;
    ops.set_link_up(LOOPBACK).step("setting loopback up")?;
    ops.add_route(&Route::default_via(slot.veth_ip()))
        .step("adding namespace default route")?;

    for rule in namespace_nat_rules(slot) {
        ops.append_rule(&rule).step("adding namespace NAT rule")?;
    }

    firewall::initialize(ops, slot).step("initializing firewall")?;

    host.return_to_origin().step("entering host namespace")?;
    ops.add_route(&host_route(slot))
        .step("adding host route")?;
    for rule in host_rules(slot, egress) {
        ops.append_rule(&rule).step("adding host forwarding rule")?;
    }

    tracing::info!(slot = idx, host_ip = %slot.host_ip(), "Slot network created");
    Ok(())
}

/// Tear down everything [`create_network`] builds, in reverse.
///
/// Every step runs even when earlier ones fail; resources that are already
/// gone count as removed. Rules inside the namespace go with it.
pub fn remove_network(ops: &dyn NetOps, slot: &mut Slot, egress: &str) -> Result<(), NetworkError> {
    let idx = slot.idx();
    let mut errors = Vec::new();

    if slot.has_firewall() {
        match enter_slot_namespace(ops, slot) {
            Ok(_guard) => {
                if let Err(e) = firewall::close(ops, slot) {
                    errors.push(e);
                }
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(slot = idx, "Namespace already gone, skipping firewall close");
            }
            Err(e) => errors.push(NetworkError::Step {
                step: "entering slot namespace",
                source: Box::new(e),
            }),
        }
        slot.take_firewall();
    }

    for rule in host_rules(slot, egress) {
        if let Err(e) = tolerate_absent(ops.delete_rule(&rule)).step("deleting host forwarding rule") {
            errors.push(e);
        }
    }
    if let Err(e) = tolerate_absent(ops.delete_route(&host_route(slot))).step("deleting host route") {
        errors.push(e);
    }
    // Deleted explicitly so the name is free before the namespace goes.
    if let Err(e) = tolerate_absent(ops.delete_link(&slot.veth_name())).step("deleting veth") {
        errors.push(e);
    }

    drop(slot.clear_network());

    if let Err(e) = tolerate_absent(ops.delete_namespace(&slot.namespace_id())).step("deleting namespace") {
        errors.push(e);
    }

    match NetworkError::from_many(errors) {
        Ok(()) => {
            tracing::info!(slot = idx, "Slot network removed");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(slot = idx, error = %e, "Slot network removal incomplete");
            Err(e)
        }
    }
}
