//! Namespace-scoped OS operations.
//!
//! [`NetOps`] is the set of primitive operations the creation, teardown and
//! repair sequences are built from. Every call acts on the namespace the calling
//! thread is currently in, so implementations are only ever driven from the
//! [`NamespaceWorker`] thread.

#[cfg(test)]
pub(crate) mod fake;
#[cfg(target_os = "linux")]
mod linux;
mod worker;

use std::fmt;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

#[cfg(target_os = "linux")]
pub use linux::LinuxNetOps;
pub use worker::NamespaceWorker;

use crate::error::NetworkError;
use crate::slot::Ipv4Cidr;

/// Label used for the handle of the namespace the process started in.
pub const HOST_NAMESPACE: &str = "host";

/// Open reference to a network namespace. Closed on drop.
pub struct NamespaceHandle {
    label: String,
    fd: OwnedFd,
}

impl NamespaceHandle {
    pub fn new(label: impl Into<String>, fd: OwnedFd) -> Self {
        Self {
            label: label.into(),
            fd,
        }
    }

    /// Namespace name, or [`HOST_NAMESPACE`].
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Handle backed by `/dev/null`, for tests that never enter the namespace.
    #[cfg(test)]
    pub(crate) fn detached(label: &str) -> Self {
        let file = std::fs::File::open("/dev/null").expect("open /dev/null");
        Self::new(label, OwnedFd::from(file))
    }
}

impl AsFd for NamespaceHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl fmt::Debug for NamespaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Route installed in the current namespace. `destination: None` is the default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Option<Ipv4Cidr>,
    pub gateway: Ipv4Addr,
}

impl Route {
    pub fn default_via(gateway: Ipv4Addr) -> Self {
        Self {
            destination: None,
            gateway,
        }
    }

    pub fn to(destination: Ipv4Cidr, gateway: Ipv4Addr) -> Self {
        Self {
            destination: Some(destination),
            gateway,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.destination {
            Some(dst) => write!(f, "{dst} via {}", self.gateway),
            None => write!(f, "default via {}", self.gateway),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

/// A packet-filter rule: table, chain and match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    pub spec: Vec<String>,
}

impl Rule {
    pub fn new<S: Into<String>>(
        table: Table,
        chain: impl Into<String>,
        spec: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            table,
            chain: chain.into(),
            spec: spec.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} {} {}",
            self.table.as_str(),
            self.chain,
            self.spec.join(" ")
        )
    }
}

/// Primitive network operations acting on the calling thread's namespace.
///
/// Deletions and lookups of absent objects report [`NetworkError::NotFound`].
pub trait NetOps: Send {
    /// Open a handle to the namespace the thread is currently in.
    fn current_namespace(&self) -> Result<NamespaceHandle, NetworkError>;

    /// Move the calling thread into `namespace`.
    fn enter_namespace(&self, namespace: &NamespaceHandle) -> Result<(), NetworkError>;

    /// Open a handle to a named namespace.
    fn open_namespace(&self, name: &str) -> Result<NamespaceHandle, NetworkError>;

    /// Create a named namespace and leave the calling thread inside it.
    fn create_namespace(&self, name: &str) -> Result<NamespaceHandle, NetworkError>;

    fn delete_namespace(&self, name: &str) -> Result<(), NetworkError>;

    /// Whether the on-disk marker of a named namespace exists.
    fn namespace_exists(&self, name: &str) -> Result<bool, NetworkError>;

    fn link_exists(&self, name: &str) -> Result<bool, NetworkError>;

    fn add_veth_pair(&self, name: &str, peer: &str) -> Result<(), NetworkError>;

    fn add_tap(&self, name: &str) -> Result<(), NetworkError>;

    fn set_link_up(&self, name: &str) -> Result<(), NetworkError>;

    fn add_address(&self, link: &str, address: Ipv4Cidr) -> Result<(), NetworkError>;

    /// Move a link from the current namespace into `target`.
    fn move_link(&self, link: &str, target: &NamespaceHandle) -> Result<(), NetworkError>;

    fn delete_link(&self, name: &str) -> Result<(), NetworkError>;

    fn add_route(&self, route: &Route) -> Result<(), NetworkError>;

    fn delete_route(&self, route: &Route) -> Result<(), NetworkError>;

    fn append_rule(&self, rule: &Rule) -> Result<(), NetworkError>;

    fn delete_rule(&self, rule: &Rule) -> Result<(), NetworkError>;

    fn new_chain(&self, table: Table, chain: &str) -> Result<(), NetworkError>;

    fn flush_chain(&self, table: Table, chain: &str) -> Result<(), NetworkError>;

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), NetworkError>;

    /// Interface carrying the host's default route.
    fn egress_interface(&self) -> Result<String, NetworkError>;
}

/// Restores the namespace that was current when the guard was created.
///
/// Restoration happens on drop, so every exit path of a sequence that switches
/// namespaces ends back where it started.
pub struct NamespaceGuard<'a> {
    ops: &'a dyn NetOps,
    origin: NamespaceHandle,
}

impl<'a> NamespaceGuard<'a> {
    pub fn capture(ops: &'a dyn NetOps) -> Result<Self, NetworkError> {
        let origin = ops.current_namespace()?;
        Ok(Self { ops, origin })
    }

    pub fn origin(&self) -> &NamespaceHandle {
        &self.origin
    }

    /// Switch back to the captured namespace without ending the guard.
    pub fn return_to_origin(&self) -> Result<(), NetworkError> {
        self.ops.enter_namespace(&self.origin)
    }
}

impl Drop for NamespaceGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ops.enter_namespace(&self.origin) {
            tracing::error!(
                namespace = %self.origin.label(),
                error = %e,
                "Failed to restore network namespace"
            );
        }
    }
}
