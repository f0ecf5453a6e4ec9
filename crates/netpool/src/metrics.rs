//! Pool occupancy gauges.
//!
//! - `netpool_new_slots`: identities waiting in the "new" queue
//! - `netpool_reused_slots`: configured slots waiting in the "reused" queue
//!
//! Both carry a constant `host` label. Values are observability only; the pool
//! never reads them back.

use prometheus::{IntGauge, Opts, Registry};

pub const NEW_SLOTS_METRIC: &str = "netpool_new_slots";
pub const REUSED_SLOTS_METRIC: &str = "netpool_reused_slots";

#[derive(Clone)]
pub struct PoolMetrics {
    pub new_slots: IntGauge,
    pub reused_slots: IntGauge,
}

impl PoolMetrics {
    /// Create the gauges and register them with `registry`.
    pub fn register(registry: &Registry, host_id: &str) -> Result<Self, prometheus::Error> {
        let new_slots = IntGauge::with_opts(
            Opts::new(NEW_SLOTS_METRIC, "Network slots waiting in the new-slot queue")
                .const_label("host", host_id),
        )?;
        let reused_slots = IntGauge::with_opts(
            Opts::new(REUSED_SLOTS_METRIC, "Network slots waiting in the reused-slot queue")
                .const_label("host", host_id),
        )?;

        registry.register(Box::new(new_slots.clone()))?;
        registry.register(Box::new(reused_slots.clone()))?;

        Ok(Self {
            new_slots,
            reused_slots,
        })
    }
}
