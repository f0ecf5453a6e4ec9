//! netpool: per-sandbox network slots for microVMs.
//!
//! Each slot is a network namespace wired to the host through a veth pair,
//! with a tap device for the guest, NAT to a host-unique address and an egress
//! firewall that can block internet access. [`NetworkPool`] keeps slots ready
//! ahead of demand and recycles them between sandboxes.
//!
//! # Architecture
//!
//! - [`SlotAllocator`]: integer identities, each mapping to a fixed addressing plan
//! - [`NetOps`]: primitive OS operations; [`LinuxNetOps`] drives `ip`/`iptables`
//! - [`NamespaceWorker`]: dedicated thread on which namespace switches happen
//! - [`create_network`] / [`remove_network`] / [`reap_dangling`]: slot lifecycle
//! - [`NetworkPool`]: "new" and "reused" queues, populate task, gauges

mod allocator;
mod cleanup;
mod config;
mod error;
mod firewall;
mod metrics;
pub mod netns;
mod network;
mod pool;
mod slot;

pub use allocator::SlotAllocator;
pub use cleanup::reap_dangling;
pub use config::PoolConfig;
pub use error::{AllocatorError, NetworkError, PoolError};
pub use firewall::{EGRESS_CHAIN, Firewall, InternetAccess};
pub use metrics::{NEW_SLOTS_METRIC, PoolMetrics, REUSED_SLOTS_METRIC};
#[cfg(target_os = "linux")]
pub use netns::LinuxNetOps;
pub use netns::{NamespaceWorker, NetOps};
pub use network::{create_network, remove_network};
pub use pool::NetworkPool;
pub use slot::{Ipv4Cidr, MAX_SLOTS, NetworkState, Slot, SlotTopology};
