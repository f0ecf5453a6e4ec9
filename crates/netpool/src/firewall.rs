//! Per-slot egress firewall.
//!
//! Guest traffic leaving through the namespace (tap to vpeer) is sent through a
//! dedicated chain in the namespace's filter table. An empty chain allows
//! everything; blocking internet access fills it with an accept rule for
//! established flows followed by a drop.
//!
//! Every function here acts on the namespace the calling thread is in; callers
//! enter the slot namespace first.

use crate::error::{NetworkError, StepContext, tolerate_absent};
use crate::netns::{NetOps, Rule, Table};
use crate::slot::Slot;

pub const EGRESS_CHAIN: &str = "NETPOOL-EGRESS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternetAccess {
    Allowed,
    Blocked,
}

impl InternetAccess {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed { Self::Allowed } else { Self::Blocked }
    }
}

/// In-memory record of an initialized egress chain.
#[derive(Debug)]
pub struct Firewall {
    internet: InternetAccess,
}

impl Firewall {
    pub fn new() -> Self {
        Self {
            internet: InternetAccess::Allowed,
        }
    }

    pub fn internet(&self) -> InternetAccess {
        self.internet
    }

    pub(crate) fn set_internet(&mut self, internet: InternetAccess) {
        self.internet = internet;
    }
}

impl Default for Firewall {
    fn default() -> Self {
        Self::new()
    }
}

fn hook_rule(slot: &Slot) -> Rule {
    Rule::new(
        Table::Filter,
        "FORWARD",
        [
            "-i".to_string(),
            slot.tap_name(),
            "-o".to_string(),
            slot.vpeer_name(),
            "-j".to_string(),
            EGRESS_CHAIN.to_string(),
        ],
    )
}

fn block_rules() -> [Rule; 2] {
    [
        Rule::new(
            Table::Filter,
            EGRESS_CHAIN,
            ["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
        ),
        Rule::new(Table::Filter, EGRESS_CHAIN, ["-j", "DROP"]),
    ]
}

/// Remove the hook and chain if they exist. Absent pieces are fine.
fn remove_chain(ops: &dyn NetOps, slot: &Slot) -> Result<(), NetworkError> {
    tolerate_absent(ops.delete_rule(&hook_rule(slot))).step("unhooking egress chain")?;
    tolerate_absent(ops.flush_chain(Table::Filter, EGRESS_CHAIN)).step("flushing egress chain")?;
    tolerate_absent(ops.delete_chain(Table::Filter, EGRESS_CHAIN)).step("deleting egress chain")
}

/// Create and hook the egress chain, allowing all traffic.
///
/// No-op when the slot already has a firewall. Chain state left in the
/// namespace by an earlier process is replaced.
pub fn initialize(ops: &dyn NetOps, slot: &mut Slot) -> Result<(), NetworkError> {
    if slot.has_firewall() {
        tracing::debug!(slot = slot.idx(), "Firewall already initialized");
        return Ok(());
    }

    remove_chain(ops, slot)?;
    ops.new_chain(Table::Filter, EGRESS_CHAIN)
        .step("creating egress chain")?;
    ops.append_rule(&hook_rule(slot))
        .step("hooking egress chain")?;

    slot.install_firewall(Firewall::new());
    tracing::debug!(slot = slot.idx(), "Firewall initialized");
    Ok(())
}

/// Apply the internet policy for the slot's next tenant.
pub fn configure_internet(ops: &dyn NetOps, slot: &mut Slot, allow: bool) -> Result<(), NetworkError> {
    let idx = slot.idx();
    if !slot.has_firewall() {
        return Err(NetworkError::FirewallMissing(idx));
    }

    ops.flush_chain(Table::Filter, EGRESS_CHAIN)
        .step("flushing egress chain")?;
    let access = InternetAccess::from_allowed(allow);
    if access == InternetAccess::Blocked {
        for rule in block_rules() {
            ops.append_rule(&rule).step("blocking internet access")?;
        }
    }

    if let Some(firewall) = slot.firewall_mut() {
        firewall.set_internet(access);
    }
    tracing::debug!(slot = idx, ?access, "Internet access configured");
    Ok(())
}

/// Return the policy to "allowed" before the slot is reused.
pub fn reset_internet(ops: &dyn NetOps, slot: &mut Slot) -> Result<(), NetworkError> {
    configure_internet(ops, slot, true)
}

/// Unhook and delete the egress chain, dropping the firewall from the slot.
pub fn close(ops: &dyn NetOps, slot: &mut Slot) -> Result<(), NetworkError> {
    if slot.take_firewall().is_none() {
        return Ok(());
    }
    remove_chain(ops, slot)?;
    tracing::debug!(slot = slot.idx(), "Firewall closed");
    Ok(())
}
