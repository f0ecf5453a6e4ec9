//! Network slot: an identity plus everything derived from it.
//!
//! Names and addresses are pure functions of the slot index. Device and namespace
//! names are the only record that survives a crash, so the reaper must be able to
//! recompute them without any stored state.
//!
//! Address plan (one identity per row):
//! - host-visible IP: `10.11.0.0/16` + `idx + 1` (`/32`)
//! - veth/vpeer: `/30` block `idx` of `10.12.0.0/16` (`.1` veth, `.2` vpeer)
//! - tap/guest: `/30` block `idx` of `10.13.0.0/16` (`.1` tap, `.2` guest)

use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::firewall::Firewall;
use crate::netns::NamespaceHandle;

const HOST_NETWORK: Ipv4Addr = Ipv4Addr::new(10, 11, 0, 0);
const VRT_NETWORK: Ipv4Addr = Ipv4Addr::new(10, 12, 0, 0);
const TAP_NETWORK: Ipv4Addr = Ipv4Addr::new(10, 13, 0, 0);

const NETWORK_PREFIX: u8 = 16;
const HOST_PREFIX: u8 = 32;
pub const VRT_PREFIX: u8 = 30;
pub const TAP_PREFIX: u8 = 30;

const ADDRESSES_PER_BLOCK: u32 = 1 << (32 - VRT_PREFIX as u32);

/// Number of identities the address plan can hold (`/30` blocks in a `/16`).
pub const MAX_SLOTS: u32 = 1 << (VRT_PREFIX as u32 - NETWORK_PREFIX as u32);

pub const TAP_MAC: &str = "02:FC:00:00:00:05";

/// An IPv4 address with a prefix length, e.g. `10.11.0.4/32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub const fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    pub fn mask(&self) -> Ipv4Addr {
        prefix_mask(self.prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

fn prefix_mask(prefix: u8) -> Ipv4Addr {
    let bits = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    };
    Ipv4Addr::from(bits)
}

fn offset(base: Ipv4Addr, by: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base) + by)
}

/// Address with the last bit flipped: the other end of a point-to-point pair.
pub fn peer_ip(ip: Ipv4Addr) -> Ipv4Addr {
    let mut octets = ip.octets();
    octets[3] ^= 0x01;
    Ipv4Addr::from(octets)
}

/// Lifecycle of the OS resources attached to a slot.
///
/// `namespace` is `None` in the ready states when the namespace outlived the
/// process that created it: it exists on disk but no handle is held.
#[derive(Debug, Default)]
pub enum NetworkState {
    #[default]
    NoNetwork,
    NetworkReady {
        namespace: Option<NamespaceHandle>,
    },
    FirewallReady {
        namespace: Option<NamespaceHandle>,
        firewall: Firewall,
    },
}

impl NetworkState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoNetwork => "no_network",
            Self::NetworkReady { .. } => "network_ready",
            Self::FirewallReady { .. } => "firewall_ready",
        }
    }
}

/// Serializable view of every value derived from a slot index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotTopology {
    pub idx: u32,
    pub namespace: String,
    pub veth: String,
    pub vpeer: String,
    pub tap: String,
    pub veth_ip: String,
    pub vpeer_ip: String,
    pub vrt_mask: String,
    pub host_ip: String,
    pub host_cidr: String,
    pub tap_ip: String,
    pub tap_cidr: String,
    pub namespace_ip: String,
    pub tap_mac: String,
}

/// One network identity and its OS resources.
///
/// Exclusively owned: by the pool while queued, by the caller between
/// `get` and `put_back`.
#[derive(Debug)]
pub struct Slot {
    idx: u32,
    state: NetworkState,
}

impl Slot {
    /// Wrap an identity. No OS resources are created.
    pub fn new(idx: u32) -> Self {
        debug_assert!(idx < MAX_SLOTS, "slot index {idx} outside the address plan");
        Self {
            idx,
            state: NetworkState::NoNetwork,
        }
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn namespace_id(&self) -> String {
        format!("ns-{}", self.idx)
    }

    pub fn veth_name(&self) -> String {
        format!("veth-{}", self.idx)
    }

    pub fn vpeer_name(&self) -> String {
        format!("vpeer-{}", self.idx)
    }

    pub fn tap_name(&self) -> String {
        format!("tap-{}", self.idx)
    }

    fn vrt_block(&self) -> u32 {
        self.idx * ADDRESSES_PER_BLOCK
    }

    pub fn veth_ip(&self) -> Ipv4Addr {
        offset(VRT_NETWORK, self.vrt_block() + 1)
    }

    pub fn vpeer_ip(&self) -> Ipv4Addr {
        offset(VRT_NETWORK, self.vrt_block() + 2)
    }

    pub fn vrt_mask(&self) -> Ipv4Addr {
        prefix_mask(VRT_PREFIX)
    }

    /// Host-visible address of the sandbox; NAT target for inbound traffic.
    pub fn host_ip(&self) -> Ipv4Addr {
        offset(HOST_NETWORK, self.idx + 1)
    }

    pub fn host_ip_string(&self) -> String {
        self.host_ip().to_string()
    }

    pub fn host_net(&self) -> Ipv4Cidr {
        Ipv4Cidr::new(self.host_ip(), HOST_PREFIX)
    }

    pub fn host_cidr(&self) -> String {
        self.host_net().to_string()
    }

    pub fn tap_ip(&self) -> Ipv4Addr {
        offset(TAP_NETWORK, self.vrt_block() + 1)
    }

    pub fn tap_prefix(&self) -> u8 {
        TAP_PREFIX
    }

    pub fn tap_mask(&self) -> Ipv4Addr {
        prefix_mask(TAP_PREFIX)
    }

    pub fn tap_cidr(&self) -> Ipv4Cidr {
        Ipv4Cidr::new(self.tap_ip(), TAP_PREFIX)
    }

    /// Address of the guest NIC inside the namespace.
    pub fn namespace_ip(&self) -> Ipv4Addr {
        offset(TAP_NETWORK, self.vrt_block() + 2)
    }

    pub fn tap_mac(&self) -> &'static str {
        TAP_MAC
    }

    /// Addresses a host process may use to reach the sandbox, deduplicated.
    pub fn interface_ips(&self) -> Vec<Ipv4Addr> {
        let mut ips = Vec::with_capacity(3);
        for ip in [self.veth_ip(), peer_ip(self.veth_ip()), self.host_ip()] {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        ips
    }

    /// Address used for guest-agent requests.
    pub fn guest_agent_ip(&self) -> Ipv4Addr {
        self.host_ip()
    }

    pub fn topology(&self) -> SlotTopology {
        SlotTopology {
            idx: self.idx,
            namespace: self.namespace_id(),
            veth: self.veth_name(),
            vpeer: self.vpeer_name(),
            tap: self.tap_name(),
            veth_ip: self.veth_ip().to_string(),
            vpeer_ip: self.vpeer_ip().to_string(),
            vrt_mask: self.vrt_mask().to_string(),
            host_ip: self.host_ip_string(),
            host_cidr: self.host_cidr(),
            tap_ip: self.tap_ip().to_string(),
            tap_cidr: self.tap_cidr().to_string(),
            namespace_ip: self.namespace_ip().to_string(),
            tap_mac: TAP_MAC.to_string(),
        }
    }

    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    pub fn namespace(&self) -> Option<&NamespaceHandle> {
        match &self.state {
            NetworkState::NoNetwork => None,
            NetworkState::NetworkReady { namespace } => namespace.as_ref(),
            NetworkState::FirewallReady { namespace, .. } => namespace.as_ref(),
        }
    }

    pub fn firewall(&self) -> Option<&Firewall> {
        match &self.state {
            NetworkState::FirewallReady { firewall, .. } => Some(firewall),
            _ => None,
        }
    }

    pub fn has_firewall(&self) -> bool {
        self.firewall().is_some()
    }

    pub(crate) fn firewall_mut(&mut self) -> Option<&mut Firewall> {
        match &mut self.state {
            NetworkState::FirewallReady { firewall, .. } => Some(firewall),
            _ => None,
        }
    }

    /// Store the handle of a freshly created namespace.
    ///
    /// Any previous state is stale at this point and is discarded.
    pub(crate) fn attach_namespace(&mut self, handle: NamespaceHandle) {
        let previous = std::mem::replace(
            &mut self.state,
            NetworkState::NetworkReady {
                namespace: Some(handle),
            },
        );
        if !matches!(previous, NetworkState::NoNetwork) {
            tracing::warn!(
                slot = self.idx,
                previous = previous.name(),
                "Discarding stale network state on namespace attach"
            );
        }
    }

    /// Record an initialized firewall. Returns `false` if one is already present.
    pub(crate) fn install_firewall(&mut self, firewall: Firewall) -> bool {
        let state = std::mem::take(&mut self.state);
        let (state, installed) = match state {
            NetworkState::NoNetwork => (
                NetworkState::FirewallReady {
                    namespace: None,
                    firewall,
                },
                true,
            ),
            NetworkState::NetworkReady { namespace } => {
                (NetworkState::FirewallReady { namespace, firewall }, true)
            }
            ready @ NetworkState::FirewallReady { .. } => (ready, false),
        };
        self.state = state;
        installed
    }

    /// Drop the firewall from the state, keeping any namespace handle.
    pub(crate) fn take_firewall(&mut self) -> Option<Firewall> {
        match std::mem::take(&mut self.state) {
            NetworkState::FirewallReady { namespace, firewall } => {
                self.state = match namespace {
                    Some(handle) => NetworkState::NetworkReady {
                        namespace: Some(handle),
                    },
                    None => NetworkState::NoNetwork,
                };
                Some(firewall)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Reset to [`NetworkState::NoNetwork`], returning the handle if one was held.
    pub(crate) fn clear_network(&mut self) -> Option<NamespaceHandle> {
        match std::mem::take(&mut self.state) {
            NetworkState::NoNetwork => None,
            NetworkState::NetworkReady { namespace } => namespace,
            NetworkState::FirewallReady { namespace, .. } => namespace,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::firewall::InternetAccess;

    #[test]
    fn derived_values_are_deterministic() {
        for idx in [0, 1, 2, 255, 4096, MAX_SLOTS - 1] {
            let a = Slot::new(idx);
            let b = Slot::new(idx);
            assert_eq!(a.topology(), b.topology());
        }
    }

    #[test]
    fn identities_never_collide() {
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();

        for idx in 0..MAX_SLOTS {
            let slot = Slot::new(idx);
            for name in [
                slot.namespace_id(),
                slot.veth_name(),
                slot.vpeer_name(),
                slot.tap_name(),
            ] {
                assert!(name.len() <= 15, "{name} exceeds IFNAMSIZ");
                assert!(names.insert(name.clone()), "duplicate name {name}");
            }
            for ip in [
                slot.veth_ip(),
                slot.vpeer_ip(),
                slot.host_ip(),
                slot.tap_ip(),
                slot.namespace_ip(),
            ] {
                assert!(addresses.insert(ip), "duplicate address {ip} for slot {idx}");
            }
        }
    }

    #[test]
    fn point_to_point_pairs_share_a_block() {
        let slot = Slot::new(9);
        let mask = u32::from(slot.vrt_mask());
        assert_eq!(
            u32::from(slot.veth_ip()) & mask,
            u32::from(slot.vpeer_ip()) & mask
        );
        let tap_mask = u32::from(slot.tap_mask());
        assert_eq!(
            u32::from(slot.tap_ip()) & tap_mask,
            u32::from(slot.namespace_ip()) & tap_mask
        );
        assert_eq!(slot.vrt_mask(), Ipv4Addr::new(255, 255, 255, 252));
    }

    #[test]
    fn host_addresses_stay_in_range() {
        let last = Slot::new(MAX_SLOTS - 1);
        assert_eq!(last.host_ip(), Ipv4Addr::new(10, 11, 64, 0));
        assert_eq!(last.namespace_ip(), Ipv4Addr::new(10, 13, 255, 254));
        assert_eq!(last.vpeer_ip(), Ipv4Addr::new(10, 12, 255, 254));
    }

    #[test]
    fn peer_ip_flips_last_bit() {
        assert_eq!(peer_ip(Ipv4Addr::new(10, 12, 0, 5)), Ipv4Addr::new(10, 12, 0, 4));
        assert_eq!(peer_ip(Ipv4Addr::new(10, 12, 0, 4)), Ipv4Addr::new(10, 12, 0, 5));
    }

    #[test]
    fn interface_ips_are_unique() {
        let slot = Slot::new(3);
        let ips = slot.interface_ips();
        assert_eq!(ips.len(), 3);
        assert_eq!(ips[0], slot.veth_ip());
        assert_eq!(ips[2], slot.host_ip());
        assert_eq!(slot.guest_agent_ip(), slot.host_ip());
    }

    #[test]
    fn topology_snapshot() {
        insta::assert_json_snapshot!("slot_topology_7", Slot::new(7).topology());
    }

    #[test]
    fn firewall_install_is_guarded() {
        let mut slot = Slot::new(1);
        assert!(slot.install_firewall(Firewall::new()));
        assert_eq!(slot.state().name(), "firewall_ready");

        let mut second = Firewall::new();
        second.set_internet(InternetAccess::Blocked);
        assert!(!slot.install_firewall(second));
        assert_eq!(
            slot.firewall().map(|f| f.internet()),
            Some(InternetAccess::Allowed)
        );

        assert!(slot.take_firewall().is_some());
        assert_eq!(slot.state().name(), "no_network");
        assert!(slot.take_firewall().is_none());
    }

    #[test]
    fn namespace_handle_transitions() {
        let mut slot = Slot::new(2);
        assert!(slot.clear_network().is_none());

        slot.attach_namespace(NamespaceHandle::detached("ns-2"));
        assert_eq!(slot.state().name(), "network_ready");
        assert!(slot.namespace().is_some());

        assert!(slot.install_firewall(Firewall::new()));
        assert!(slot.namespace().is_some());
        assert!(slot.has_firewall());

        assert!(slot.clear_network().is_some());
        assert_eq!(slot.state().name(), "no_network");
        assert!(slot.namespace().is_none());

        // A namespace that outlived its creator: firewall known, no handle held.
        assert!(slot.install_firewall(Firewall::new()));
        assert_eq!(slot.state().name(), "firewall_ready");
        assert!(slot.namespace().is_none());
    }
}
