//! [`NetOps`] backed by the kernel.
//!
//! Namespaces are handled with direct syscalls: a named namespace is the
//! calling thread's network namespace bind-mounted onto a file under the netns
//! directory, the same layout `ip netns` uses. Links, routes and packet-filter
//! rules go through `ip` and `iptables`, run as children of the calling thread
//! so they act on whichever namespace that thread is in.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, setns, unshare};

use super::{HOST_NAMESPACE, NamespaceHandle, NetOps, Route, Rule, Table};
use crate::error::NetworkError;
use crate::slot::Ipv4Cidr;

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Fragments of `ip`/`iptables` diagnostics that mean the target is absent.
const ABSENT_MARKERS: &[&str] = &[
    "Cannot find device",
    "does not exist",
    "No such file or directory",
    "No such process",
    "does a matching rule exist",
    "No chain/target/match by that name",
];

pub struct LinuxNetOps {
    netns_dir: PathBuf,
    egress: Option<String>,
    /// Label of the namespace the owning thread last entered.
    current: RefCell<String>,
}

impl LinuxNetOps {
    pub fn new(netns_dir: impl Into<PathBuf>) -> Self {
        Self {
            netns_dir: netns_dir.into(),
            egress: None,
            current: RefCell::new(HOST_NAMESPACE.to_string()),
        }
    }

    /// Use `interface` for host egress instead of detecting it.
    pub fn with_egress(mut self, interface: Option<String>) -> Self {
        self.egress = interface;
        self
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.netns_dir.join(name)
    }

    fn iptables(&self, table: Table, args: &[&str]) -> Result<String, NetworkError> {
        let mut full = vec!["-w", "-t", table.as_str()];
        full.extend_from_slice(args);
        run("iptables", &full)
    }

    fn rule_command(&self, action: &str, rule: &Rule) -> Result<(), NetworkError> {
        let mut args = vec![action, rule.chain.as_str()];
        args.extend(rule.spec.iter().map(String::as_str));
        self.iptables(rule.table, &args).map(|_| ())
    }

    fn route_command(&self, action: &str, route: &Route) -> Result<(), NetworkError> {
        let destination = route
            .destination
            .map(|d| d.to_string())
            .unwrap_or_else(|| "default".to_string());
        let gateway = route.gateway.to_string();
        run("ip", &["route", action, &destination, "via", &gateway]).map(|_| ())
    }
}

impl NetOps for LinuxNetOps {
    fn current_namespace(&self) -> Result<NamespaceHandle, NetworkError> {
        let file = File::open(THREAD_NETNS).map_err(|e| NetworkError::io(THREAD_NETNS, e))?;
        Ok(NamespaceHandle::new(
            self.current.borrow().clone(),
            OwnedFd::from(file),
        ))
    }

    fn enter_namespace(&self, namespace: &NamespaceHandle) -> Result<(), NetworkError> {
        setns(namespace, CloneFlags::CLONE_NEWNET)
            .map_err(|e| nix_error(format!("setns {}", namespace.label()), e))?;
        *self.current.borrow_mut() = namespace.label().to_string();
        Ok(())
    }

    fn open_namespace(&self, name: &str) -> Result<NamespaceHandle, NetworkError> {
        let path = self.marker(name);
        let file = File::open(&path).map_err(|e| NetworkError::io(path.display().to_string(), e))?;
        Ok(NamespaceHandle::new(name, OwnedFd::from(file)))
    }

    fn create_namespace(&self, name: &str) -> Result<NamespaceHandle, NetworkError> {
        std::fs::create_dir_all(&self.netns_dir)
            .map_err(|e| NetworkError::io(self.netns_dir.display().to_string(), e))?;

        let path = self.marker(name);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| NetworkError::io(path.display().to_string(), e))?;

        if let Err(e) = unshare(CloneFlags::CLONE_NEWNET) {
            let _ = std::fs::remove_file(&path);
            return Err(nix_error("unshare", e));
        }
        *self.current.borrow_mut() = name.to_string();

        if let Err(e) = mount(
            Some(THREAD_NETNS),
            path.as_path(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            let _ = std::fs::remove_file(&path);
            return Err(nix_error(format!("bind mount {}", path.display()), e));
        }

        tracing::debug!(namespace = %name, "Created network namespace");
        self.open_namespace(name)
    }

    fn delete_namespace(&self, name: &str) -> Result<(), NetworkError> {
        let path = self.marker(name);
        if !path_exists(&path)? {
            return Err(NetworkError::NotFound(path.display().to_string()));
        }
        match umount2(path.as_path(), MntFlags::MNT_DETACH) {
            // Not a mount point: a marker left behind by an interrupted create.
            Ok(()) | Err(Errno::EINVAL) => {}
            Err(e) => return Err(nix_error(format!("umount {}", path.display()), e)),
        }
        std::fs::remove_file(&path).map_err(|e| NetworkError::io(path.display().to_string(), e))?;
        tracing::debug!(namespace = %name, "Deleted network namespace");
        Ok(())
    }

    fn namespace_exists(&self, name: &str) -> Result<bool, NetworkError> {
        path_exists(&self.marker(name))
    }

    fn link_exists(&self, name: &str) -> Result<bool, NetworkError> {
        match run("ip", &["link", "show", "dev", name]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn add_veth_pair(&self, name: &str, peer: &str) -> Result<(), NetworkError> {
        run("ip", &["link", "add", name, "type", "veth", "peer", "name", peer]).map(|_| ())
    }

    fn add_tap(&self, name: &str) -> Result<(), NetworkError> {
        run("ip", &["tuntap", "add", "dev", name, "mode", "tap"]).map(|_| ())
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetworkError> {
        run("ip", &["link", "set", "dev", name, "up"]).map(|_| ())
    }

    fn add_address(&self, link: &str, address: Ipv4Cidr) -> Result<(), NetworkError> {
        run("ip", &["addr", "add", &address.to_string(), "dev", link]).map(|_| ())
    }

    fn move_link(&self, link: &str, target: &NamespaceHandle) -> Result<(), NetworkError> {
        // `ip` resolves a path argument as a namespace file; our descriptor is
        // reachable through procfs from the child.
        let target_path = format!(
            "/proc/{}/fd/{}",
            std::process::id(),
            target.as_fd().as_raw_fd()
        );
        run("ip", &["link", "set", "dev", link, "netns", &target_path]).map(|_| ())
    }

    fn delete_link(&self, name: &str) -> Result<(), NetworkError> {
        run("ip", &["link", "del", "dev", name]).map(|_| ())
    }

    fn add_route(&self, route: &Route) -> Result<(), NetworkError> {
        self.route_command("add", route)
    }

    fn delete_route(&self, route: &Route) -> Result<(), NetworkError> {
        self.route_command("del", route)
    }

    fn append_rule(&self, rule: &Rule) -> Result<(), NetworkError> {
        self.rule_command("-A", rule)
    }

    fn delete_rule(&self, rule: &Rule) -> Result<(), NetworkError> {
        self.rule_command("-D", rule)
    }

    fn new_chain(&self, table: Table, chain: &str) -> Result<(), NetworkError> {
        self.iptables(table, &["-N", chain]).map(|_| ())
    }

    fn flush_chain(&self, table: Table, chain: &str) -> Result<(), NetworkError> {
        self.iptables(table, &["-F", chain]).map(|_| ())
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), NetworkError> {
        self.iptables(table, &["-X", chain]).map(|_| ())
    }

    fn egress_interface(&self) -> Result<String, NetworkError> {
        if let Some(interface) = &self.egress {
            return Ok(interface.clone());
        }
        let routes = run("ip", &["-4", "route", "show", "default"])?;
        default_route_device(&routes)
            .map(str::to_string)
            .ok_or_else(|| NetworkError::NotFound("default route".to_string()))
    }
}

fn path_exists(path: &Path) -> Result<bool, NetworkError> {
    path.try_exists()
        .map_err(|e| NetworkError::io(path.display().to_string(), e))
}

fn nix_error(op: impl Into<String>, errno: Errno) -> NetworkError {
    let op = op.into();
    if errno == Errno::ENOENT {
        return NetworkError::NotFound(op);
    }
    NetworkError::Nix {
        op,
        errno: errno.to_string(),
    }
}

/// Run a tool to completion, returning its stdout.
fn run(program: &str, args: &[&str]) -> Result<String, NetworkError> {
    let command = format!("{program} {}", args.join(" "));
    tracing::trace!(%command, "Running network command");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| NetworkError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(classify_failure(command, stderr))
}

fn classify_failure(command: String, stderr: String) -> NetworkError {
    if ABSENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        NetworkError::NotFound(command)
    } else {
        NetworkError::Command { command, stderr }
    }
}

/// Device name from the first `default ... dev X` line of `ip route` output.
fn default_route_device(routes: &str) -> Option<&str> {
    routes
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "dev")?;
            words.next()
        })
}
