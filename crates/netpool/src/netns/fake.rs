//! In-memory [`NetOps`] for tests.
//!
//! Models namespaces, links, routes, rules and chains closely enough for the
//! creation, teardown and repair sequences to be checked without privileges.
//! Clones share state, so a test can hand one clone to a worker and inspect
//! through another.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{HOST_NAMESPACE, NamespaceHandle, NetOps, Route, Rule, Table};
use crate::error::NetworkError;
use crate::slot::Ipv4Cidr;

pub const FAKE_EGRESS: &str = "eth0";

const BUILTIN_CHAINS: &[(Table, &str)] = &[
    (Table::Filter, "INPUT"),
    (Table::Filter, "FORWARD"),
    (Table::Filter, "OUTPUT"),
    (Table::Nat, "PREROUTING"),
    (Table::Nat, "INPUT"),
    (Table::Nat, "OUTPUT"),
    (Table::Nat, "POSTROUTING"),
];

#[derive(Debug, Default, Clone)]
pub struct Link {
    pub up: bool,
    pub addresses: Vec<Ipv4Cidr>,
}

#[derive(Debug, Default, Clone)]
pub struct Namespace {
    pub links: BTreeMap<String, Link>,
    pub routes: Vec<Route>,
    pub rules: Vec<Rule>,
    pub chains: BTreeSet<(Table, String)>,
}

impl Namespace {
    fn with_loopback() -> Self {
        let mut ns = Self::default();
        ns.links.insert("lo".to_string(), Link::default());
        ns
    }

    fn has_chain(&self, table: Table, chain: &str) -> bool {
        BUILTIN_CHAINS.contains(&(table, chain)) || self.chains.contains(&(table, chain.to_string()))
    }
}

enum Failure {
    Once,
    Always,
}

pub struct FakeState {
    /// Namespace the worker thread is currently in.
    pub current: String,
    pub namespaces: BTreeMap<String, Namespace>,
    peers: HashMap<String, String>,
    failures: HashMap<String, Failure>,
}

#[derive(Clone)]
pub struct FakeNetOps {
    state: Arc<Mutex<FakeState>>,
}

impl FakeNetOps {
    pub fn new() -> Self {
        let mut host = Namespace::with_loopback();
        host.links.insert(
            FAKE_EGRESS.to_string(),
            Link {
                up: true,
                addresses: Vec::new(),
            },
        );
        let mut namespaces = BTreeMap::new();
        namespaces.insert(HOST_NAMESPACE.to_string(), host);

        Self {
            state: Arc::new(Mutex::new(FakeState {
                current: HOST_NAMESPACE.to_string(),
                namespaces,
                peers: HashMap::new(),
                failures: HashMap::new(),
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Make the next call of `op` fail.
    pub fn fail_once(&self, op: &str) {
        self.state().failures.insert(op.to_string(), Failure::Once);
    }

    /// Make every call of `op` fail until [`FakeNetOps::heal`].
    pub fn fail_always(&self, op: &str) {
        self.state().failures.insert(op.to_string(), Failure::Always);
    }

    pub fn heal(&self) {
        self.state().failures.clear();
    }

    /// Named namespaces present on disk.
    pub fn namespace_names(&self) -> Vec<String> {
        self.state()
            .namespaces
            .keys()
            .filter(|n| *n != HOST_NAMESPACE)
            .cloned()
            .collect()
    }

    pub fn links(&self, namespace: &str) -> Vec<String> {
        self.state()
            .namespaces
            .get(namespace)
            .map(|ns| ns.links.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rules(&self, namespace: &str) -> Vec<String> {
        self.state()
            .namespaces
            .get(namespace)
            .map(|ns| ns.rules.iter().map(Rule::to_string).collect())
            .unwrap_or_default()
    }

    pub fn routes(&self, namespace: &str) -> Vec<String> {
        self.state()
            .namespaces
            .get(namespace)
            .map(|ns| ns.routes.iter().map(Route::to_string).collect())
            .unwrap_or_default()
    }

    pub fn chains(&self, namespace: &str) -> Vec<String> {
        self.state()
            .namespaces
            .get(namespace)
            .map(|ns| ns.chains.iter().map(|(_, c)| c.clone()).collect())
            .unwrap_or_default()
    }

    /// No named namespaces, and the host holds nothing beyond its initial links.
    pub fn is_pristine(&self) -> bool {
        let state = self.state();
        let Some(host) = state.namespaces.get(HOST_NAMESPACE) else {
            return false;
        };
        state.namespaces.len() == 1
            && state.current == HOST_NAMESPACE
            && host.links.keys().eq(["eth0", "lo"].iter().copied())
            && host.routes.is_empty()
            && host.rules.is_empty()
            && host.chains.is_empty()
            && state.peers.is_empty()
    }

    fn with_state<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut FakeState) -> Result<T, NetworkError>,
    ) -> Result<T, NetworkError> {
        let mut state = self.state();
        if let Some(once) = state.failures.get(op).map(|f| matches!(f, Failure::Once)) {
            if once {
                state.failures.remove(op);
            }
            return Err(injected(op));
        }
        f(&mut state)
    }

    fn with_current<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut Namespace) -> Result<T, NetworkError>,
    ) -> Result<T, NetworkError> {
        self.with_state(op, |state| {
            let current = state.current.clone();
            let ns = state
                .namespaces
                .get_mut(&current)
                .ok_or(NetworkError::NotFound(current))?;
            f(ns)
        })
    }
}

impl Default for FakeNetOps {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(op: &str) -> NetworkError {
    NetworkError::Command {
        command: op.to_string(),
        stderr: "injected failure".to_string(),
    }
}

fn exists(what: impl std::fmt::Display) -> NetworkError {
    NetworkError::Command {
        command: what.to_string(),
        stderr: "File exists".to_string(),
    }
}

fn handle(label: &str) -> Result<NamespaceHandle, NetworkError> {
    let file = std::fs::File::open("/dev/null").map_err(|e| NetworkError::io("open /dev/null", e))?;
    Ok(NamespaceHandle::new(label, OwnedFd::from(file)))
}

impl FakeState {
    /// Veth pairs die together: drop the peer of `name` wherever it lives.
    fn drop_peer(&mut self, name: &str) {
        if let Some(peer) = self.peers.remove(name) {
            self.peers.remove(&peer);
            for ns in self.namespaces.values_mut() {
                ns.links.remove(&peer);
            }
        }
    }
}

impl NetOps for FakeNetOps {
    fn current_namespace(&self) -> Result<NamespaceHandle, NetworkError> {
        let current = self.with_state("current_namespace", |state| Ok(state.current.clone()))?;
        handle(&current)
    }

    fn enter_namespace(&self, namespace: &NamespaceHandle) -> Result<(), NetworkError> {
        self.with_state("enter_namespace", |state| {
            if !state.namespaces.contains_key(namespace.label()) {
                return Err(NetworkError::NotFound(namespace.label().to_string()));
            }
            state.current = namespace.label().to_string();
            Ok(())
        })
    }

    fn open_namespace(&self, name: &str) -> Result<NamespaceHandle, NetworkError> {
        self.with_state("open_namespace", |state| {
            if state.namespaces.contains_key(name) {
                Ok(())
            } else {
                Err(NetworkError::NotFound(name.to_string()))
            }
        })?;
        handle(name)
    }

    fn create_namespace(&self, name: &str) -> Result<NamespaceHandle, NetworkError> {
        self.with_state("create_namespace", |state| {
            if state.namespaces.contains_key(name) {
                return Err(exists(format!("netns add {name}")));
            }
            state
                .namespaces
                .insert(name.to_string(), Namespace::with_loopback());
            state.current = name.to_string();
            Ok(())
        })?;
        handle(name)
    }

    fn delete_namespace(&self, name: &str) -> Result<(), NetworkError> {
        self.with_state("delete_namespace", |state| {
            if name == HOST_NAMESPACE {
                return Err(NetworkError::NotFound(name.to_string()));
            }
            let ns = state
                .namespaces
                .remove(name)
                .ok_or_else(|| NetworkError::NotFound(name.to_string()))?;
            for link in ns.links.keys() {
                state.drop_peer(link);
            }
            Ok(())
        })
    }

    fn namespace_exists(&self, name: &str) -> Result<bool, NetworkError> {
        self.with_state("namespace_exists", |state| {
            Ok(name != HOST_NAMESPACE && state.namespaces.contains_key(name))
        })
    }

    fn link_exists(&self, name: &str) -> Result<bool, NetworkError> {
        self.with_current("link_exists", |ns| Ok(ns.links.contains_key(name)))
    }

    fn add_veth_pair(&self, name: &str, peer: &str) -> Result<(), NetworkError> {
        self.with_state("add_veth_pair", |state| {
            let current = state.current.clone();
            let ns = state
                .namespaces
                .get_mut(&current)
                .ok_or(NetworkError::NotFound(current))?;
            if ns.links.contains_key(name) || ns.links.contains_key(peer) {
                return Err(exists(format!("link add {name} peer {peer}")));
            }
            ns.links.insert(name.to_string(), Link::default());
            ns.links.insert(peer.to_string(), Link::default());
            state.peers.insert(name.to_string(), peer.to_string());
            state.peers.insert(peer.to_string(), name.to_string());
            Ok(())
        })
    }

    fn add_tap(&self, name: &str) -> Result<(), NetworkError> {
        self.with_current("add_tap", |ns| {
            if ns.links.contains_key(name) {
                return Err(exists(format!("tuntap add {name}")));
            }
            ns.links.insert(name.to_string(), Link::default());
            Ok(())
        })
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetworkError> {
        self.with_current("set_link_up", |ns| {
            let link = ns
                .links
                .get_mut(name)
                .ok_or_else(|| NetworkError::NotFound(name.to_string()))?;
            link.up = true;
            Ok(())
        })
    }

    fn add_address(&self, link: &str, address: Ipv4Cidr) -> Result<(), NetworkError> {
        self.with_current("add_address", |ns| {
            let entry = ns
                .links
                .get_mut(link)
                .ok_or_else(|| NetworkError::NotFound(link.to_string()))?;
            if entry.addresses.contains(&address) {
                return Err(exists(format!("addr add {address} dev {link}")));
            }
            entry.addresses.push(address);
            Ok(())
        })
    }

    fn move_link(&self, link: &str, target: &NamespaceHandle) -> Result<(), NetworkError> {
        self.with_state("move_link", |state| {
            if !state.namespaces.contains_key(target.label()) {
                return Err(NetworkError::NotFound(target.label().to_string()));
            }
            let current = state.current.clone();
            state
                .namespaces
                .get_mut(&current)
                .and_then(|ns| ns.links.remove(link))
                .ok_or_else(|| NetworkError::NotFound(link.to_string()))?;
            // Moved links arrive down and without addresses.
            if let Some(ns) = state.namespaces.get_mut(target.label()) {
                ns.links.insert(link.to_string(), Link::default());
            }
            Ok(())
        })
    }

    fn delete_link(&self, name: &str) -> Result<(), NetworkError> {
        self.with_state("delete_link", |state| {
            let current = state.current.clone();
            state
                .namespaces
                .get_mut(&current)
                .and_then(|ns| ns.links.remove(name))
                .ok_or_else(|| NetworkError::NotFound(name.to_string()))?;
            state.drop_peer(name);
            Ok(())
        })
    }

    fn add_route(&self, route: &Route) -> Result<(), NetworkError> {
        self.with_current("add_route", |ns| {
            if ns.routes.contains(route) {
                return Err(exists(format!("route add {route}")));
            }
            ns.routes.push(route.clone());
            Ok(())
        })
    }

    fn delete_route(&self, route: &Route) -> Result<(), NetworkError> {
        self.with_current("delete_route", |ns| {
            let pos = ns
                .routes
                .iter()
                .position(|r| r == route)
                .ok_or_else(|| NetworkError::NotFound(route.to_string()))?;
            ns.routes.remove(pos);
            Ok(())
        })
    }

    fn append_rule(&self, rule: &Rule) -> Result<(), NetworkError> {
        self.with_current("append_rule", |ns| {
            if !ns.has_chain(rule.table, &rule.chain) {
                return Err(NetworkError::NotFound(rule.chain.clone()));
            }
            ns.rules.push(rule.clone());
            Ok(())
        })
    }

    fn delete_rule(&self, rule: &Rule) -> Result<(), NetworkError> {
        self.with_current("delete_rule", |ns| {
            let pos = ns
                .rules
                .iter()
                .position(|r| r == rule)
                .ok_or_else(|| NetworkError::NotFound(rule.to_string()))?;
            ns.rules.remove(pos);
            Ok(())
        })
    }

    fn new_chain(&self, table: Table, chain: &str) -> Result<(), NetworkError> {
        self.with_current("new_chain", |ns| {
            if ns.has_chain(table, chain) {
                return Err(exists(format!("-N {chain}")));
            }
            ns.chains.insert((table, chain.to_string()));
            Ok(())
        })
    }

    fn flush_chain(&self, table: Table, chain: &str) -> Result<(), NetworkError> {
        self.with_current("flush_chain", |ns| {
            if !ns.has_chain(table, chain) {
                return Err(NetworkError::NotFound(chain.to_string()));
            }
            ns.rules.retain(|r| !(r.table == table && r.chain == chain));
            Ok(())
        })
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), NetworkError> {
        self.with_current("delete_chain", |ns| {
            if !ns.chains.contains(&(table, chain.to_string())) {
                return Err(NetworkError::NotFound(chain.to_string()));
            }
            let busy = ns.rules.iter().any(|r| {
                r.table == table && (r.chain == chain || r.spec.last().is_some_and(|t| t == chain))
            });
            if busy {
                return Err(NetworkError::Command {
                    command: format!("-X {chain}"),
                    stderr: "Directory not empty".to_string(),
                });
            }
            ns.chains.remove(&(table, chain.to_string()));
            Ok(())
        })
    }

    fn egress_interface(&self) -> Result<String, NetworkError> {
        self.with_state("egress_interface", |_| Ok(FAKE_EGRESS.to_string()))
    }
}
