//! Pool configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::PoolError;
use crate::slot::MAX_SLOTS;

pub const DEFAULT_NEW_SLOTS: usize = 32;
pub const DEFAULT_REUSED_SLOTS: usize = 100;
pub const DEFAULT_NETNS_DIR: &str = "/var/run/netns";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Size of the "new" queue plus the identity the populate task holds.
    pub new_slots: usize,
    pub reused_slots: usize,
    /// Number of identities the allocator hands out.
    pub max_slots: u32,
    /// Constant `host` label on the pool gauges.
    pub host_id: String,
    pub netns_dir: PathBuf,
    /// Host interface carrying sandbox traffic; detected from the default route when unset.
    pub egress_interface: Option<String>,
    /// First delay after a failed identity acquisition; doubled per attempt.
    pub backoff_base: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            new_slots: DEFAULT_NEW_SLOTS,
            reused_slots: DEFAULT_REUSED_SLOTS,
            max_slots: MAX_SLOTS,
            host_id: uuid::Uuid::new_v4().to_string(),
            netns_dir: PathBuf::from(DEFAULT_NETNS_DIR),
            egress_interface: None,
            backoff_base: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `NETPOOL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(n) = parse_var(&lookup, "NETPOOL_NEW_SLOTS") {
            config.new_slots = n;
        }
        if let Some(n) = parse_var(&lookup, "NETPOOL_REUSED_SLOTS") {
            config.reused_slots = n;
        }
        if let Some(n) = parse_var(&lookup, "NETPOOL_MAX_SLOTS") {
            config.max_slots = n;
        }
        if let Some(id) = lookup("NETPOOL_HOST_ID").filter(|s| !s.is_empty()) {
            config.host_id = id;
        }
        if let Some(dir) = lookup("NETPOOL_NETNS_DIR").filter(|s| !s.is_empty()) {
            config.netns_dir = PathBuf::from(dir);
        }
        config.egress_interface = lookup("NETPOOL_EGRESS_INTERFACE").filter(|s| !s.is_empty());
        config
    }

    pub fn with_new_slots(mut self, n: usize) -> Self {
        self.new_slots = n;
        self
    }

    pub fn with_reused_slots(mut self, n: usize) -> Self {
        self.reused_slots = n;
        self
    }

    pub fn with_max_slots(mut self, n: u32) -> Self {
        self.max_slots = n;
        self
    }

    pub fn with_host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = host_id.into();
        self
    }

    pub fn with_netns_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.netns_dir = dir.into();
        self
    }

    pub fn with_egress_interface(mut self, interface: impl Into<String>) -> Self {
        self.egress_interface = Some(interface.into());
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Capacity of the "new" queue. The populate task holds one more identity
    /// while blocked on a full queue.
    pub fn new_queue_capacity(&self) -> usize {
        self.new_slots.saturating_sub(1).max(1)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.new_slots == 0 {
            return Err(PoolError::Config("new_slots must be at least 1".to_string()));
        }
        if self.reused_slots == 0 {
            return Err(PoolError::Config("reused_slots must be at least 1".to_string()));
        }
        if self.max_slots == 0 || self.max_slots > MAX_SLOTS {
            return Err(PoolError::Config(format!(
                "max_slots must be between 1 and {MAX_SLOTS}, got {}",
                self.max_slots
            )));
        }
        if self.host_id.is_empty() {
            return Err(PoolError::Config("host_id must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}
