//! Pool of network slots.
//!
//! A background task keeps the "new" queue topped up with bare identities;
//! their OS resources are built on demand in [`NetworkPool::get`]. Slots handed
//! back through [`NetworkPool::put_back`] keep their resources and wait in the
//! "reused" queue, which `get` prefers.
//!
//! Queued slots are owned by the pool. A slot returned from `get` is owned by
//! the caller until it is put back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use prometheus::Registry;
use rand::Rng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::allocator::SlotAllocator;
use crate::cleanup::reap_dangling;
use crate::config::PoolConfig;
use crate::error::{AllocatorError, NetworkError, PoolError};
use crate::firewall;
use crate::metrics::PoolMetrics;
use crate::netns::{NamespaceWorker, NetOps};
use crate::network::{create_network, enter_slot_namespace, remove_network};
use crate::slot::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    New,
    Reused,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reused => "reused",
        }
    }
}

/// Why a slot could not be made ready, plus the outcome of undoing it.
enum PrepareFailure {
    Probe {
        source: NetworkError,
        teardown: Option<NetworkError>,
    },
    Create {
        source: NetworkError,
        cleanup: Option<NetworkError>,
    },
    Firewall {
        source: NetworkError,
        teardown: Option<NetworkError>,
    },
}

struct PoolInner {
    allocator: SlotAllocator,
    worker: NamespaceWorker,
    metrics: PoolMetrics,
    egress: String,
    new_rx: Mutex<mpsc::Receiver<Slot>>,
    reused_tx: mpsc::Sender<Slot>,
    reused_rx: Mutex<mpsc::Receiver<Slot>>,
    lifetime: CancellationToken,
}

pub struct NetworkPool {
    inner: Arc<PoolInner>,
    populate: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl NetworkPool {
    /// Pool backed by the host's network stack.
    ///
    /// Must be called inside a tokio runtime.
    #[cfg(target_os = "linux")]
    pub fn new(
        lifetime: &CancellationToken,
        registry: &Registry,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let ops = crate::netns::LinuxNetOps::new(config.netns_dir.clone())
            .with_egress(config.egress_interface.clone());
        Self::with_ops(lifetime, registry, config, Box::new(ops))
    }

    /// Pool driving the given [`NetOps`].
    ///
    /// Must be called inside a tokio runtime. The pool stops when `lifetime` is
    /// cancelled or the pool is dropped.
    pub fn with_ops(
        lifetime: &CancellationToken,
        registry: &Registry,
        config: PoolConfig,
        ops: Box<dyn NetOps>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let egress = match &config.egress_interface {
            Some(interface) => interface.clone(),
            None => ops.egress_interface().map_err(PoolError::Egress)?,
        };
        let metrics = PoolMetrics::register(registry, &config.host_id)?;
        let worker = NamespaceWorker::spawn(ops)
            .map_err(|e| PoolError::Worker(NetworkError::io("spawning namespace worker", e)))?;

        let (new_tx, new_rx) = mpsc::channel(config.new_queue_capacity());
        let (reused_tx, reused_rx) = mpsc::channel(config.reused_slots);

        let inner = Arc::new(PoolInner {
            allocator: SlotAllocator::new(config.max_slots),
            worker,
            metrics,
            egress,
            new_rx: Mutex::new(new_rx),
            reused_tx,
            reused_rx: Mutex::new(reused_rx),
            lifetime: lifetime.child_token(),
        });

        tracing::info!(
            new_slots = config.new_slots,
            reused_slots = config.reused_slots,
            max_slots = config.max_slots,
            host_id = %config.host_id,
            egress = %inner.egress,
            "Network slot pool starting"
        );

        let populate = tokio::spawn(
            populate(Arc::clone(&inner), new_tx, config.backoff_base)
                .instrument(tracing::info_span!("netpool_populate")),
        );

        Ok(Self {
            inner,
            populate: Mutex::new(Some(populate)),
            closed: AtomicBool::new(false),
        })
    }

    /// Take a slot ready for a sandbox, with internet access set as requested.
    ///
    /// Prefers a reused slot. Waits for one to become available, until
    /// `cancel` fires or the pool closes.
    pub async fn get(&self, cancel: &CancellationToken, allow_internet: bool) -> Result<Slot, PoolError> {
        self.get_inner(cancel, allow_internet)
            .instrument(tracing::info_span!("netpool_get", allow_internet))
            .await
    }

    async fn get_inner(&self, cancel: &CancellationToken, allow_internet: bool) -> Result<Slot, PoolError> {
        let (slot, source) = self.next_slot(cancel).await?;
        let idx = slot.idx();
        tracing::debug!(slot = idx, source = source.as_str(), "Took slot from queue");

        let egress = self.inner.egress.clone();
        let prepared = self
            .inner
            .worker
            .with_slot(slot, move |ops, slot| prepare(ops, slot, &egress, allow_internet))
            .await;

        let (slot, outcome) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release_after_loss(idx);
                return Err(PoolError::Worker(e));
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!(
                    slot = idx,
                    source = source.as_str(),
                    host_ip = %slot.host_ip(),
                    "Network slot ready"
                );
                Ok(slot)
            }
            Err(failure) => {
                drop(slot);
                let release = self.inner.allocator.release(idx).err();
                let err = match failure {
                    PrepareFailure::Create { source, cleanup } => PoolError::CreateNetwork {
                        idx,
                        source,
                        cleanup,
                        release,
                    },
                    PrepareFailure::Firewall { source, teardown } => PoolError::Firewall {
                        idx,
                        source,
                        teardown: teardown_error(idx, teardown, release),
                    },
                    PrepareFailure::Probe { source, teardown } => {
                        if let Some(e) = teardown_error(idx, teardown, release) {
                            tracing::warn!(slot = idx, error = %e, "Teardown after failed probe incomplete");
                        }
                        PoolError::Probe { idx, source }
                    }
                };
                tracing::error!(slot = idx, error = %err, "Failed to prepare network slot");
                Err(err)
            }
        }
    }

    /// Dequeue a slot: reused without waiting if one is there, else whichever
    /// queue delivers first.
    async fn next_slot(&self, cancel: &CancellationToken) -> Result<(Slot, Source), PoolError> {
        if let Ok(mut reused) = self.inner.reused_rx.try_lock()
            && let Ok(slot) = reused.try_recv()
        {
            self.inner.metrics.reused_slots.dec();
            return Ok((slot, Source::Reused));
        }

        let wait = async {
            let mut reused = self.inner.reused_rx.lock().await;
            let mut new = self.inner.new_rx.lock().await;
            tokio::select! {
                biased;
                Some(slot) = reused.recv() => Some((slot, Source::Reused)),
                Some(slot) = new.recv() => Some((slot, Source::New)),
                else => None,
            }
        };

        let (slot, source) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            _ = self.inner.lifetime.cancelled() => return Err(PoolError::Closed),
            next = wait => next.ok_or(PoolError::Closed)?,
        };
        match source {
            Source::New => self.inner.metrics.new_slots.dec(),
            Source::Reused => self.inner.metrics.reused_slots.dec(),
        }
        Ok((slot, source))
    }

    /// Hand a slot back for reuse.
    ///
    /// Internet access is reset to allowed. Slots that cannot be reset, or
    /// that do not fit in the reused queue, are torn down and their identity
    /// released.
    pub async fn put_back(&self, slot: Slot) -> Result<(), PoolError> {
        let idx = slot.idx();
        self.put_back_inner(slot)
            .instrument(tracing::info_span!("netpool_put_back", slot = idx))
            .await
    }

    async fn put_back_inner(&self, slot: Slot) -> Result<(), PoolError> {
        let idx = slot.idx();
        let egress = self.inner.egress.clone();
        let reset = self
            .inner
            .worker
            .with_slot(slot, move |ops, slot| {
                let result = in_slot_namespace(ops, slot, firewall::reset_internet);
                match result {
                    Ok(()) => Ok(()),
                    Err(source) => {
                        let teardown = remove_network(ops, slot, &egress).err();
                        Err((source, teardown))
                    }
                }
            })
            .await;

        let slot = match reset {
            Ok((slot, Ok(()))) => slot,
            Ok((slot, Err((source, teardown)))) => {
                drop(slot);
                let release = self.inner.allocator.release(idx).err();
                let err = PoolError::Firewall {
                    idx,
                    source,
                    teardown: teardown_error(idx, teardown, release),
                };
                tracing::error!(slot = idx, error = %err, "Failed to reset returned slot");
                return Err(err);
            }
            Err(e) => {
                self.release_after_loss(idx);
                return Err(PoolError::Worker(e));
            }
        };

        self.inner.metrics.reused_slots.inc();
        match self.inner.reused_tx.try_send(slot) {
            Ok(()) => {
                tracing::debug!(slot = idx, "Slot queued for reuse");
                Ok(())
            }
            Err(TrySendError::Full(slot)) | Err(TrySendError::Closed(slot)) => {
                self.inner.metrics.reused_slots.dec();
                tracing::debug!(slot = idx, "Reused queue unavailable, tearing slot down");
                self.teardown(slot).await
            }
        }
    }

    /// Remove a slot's resources and release its identity.
    async fn teardown(&self, slot: Slot) -> Result<(), PoolError> {
        let idx = slot.idx();
        let egress = self.inner.egress.clone();
        let mut errors = Vec::new();

        match self
            .inner
            .worker
            .with_slot(slot, move |ops, slot| remove_network(ops, slot, &egress))
            .await
        {
            Ok((_, Ok(()))) => {}
            Ok((_, Err(source))) => errors.push(PoolError::Teardown { idx, source }),
            Err(e) => errors.push(PoolError::Worker(e)),
        }
        if let Err(e) = self.inner.allocator.release(idx) {
            errors.push(PoolError::Acquire(e));
        }
        PoolError::from_many(errors)
    }

    fn release_after_loss(&self, idx: u32) {
        if let Err(e) = self.inner.allocator.release(idx) {
            tracing::error!(slot = idx, error = %e, "Failed to release identity of lost slot");
        }
    }

    /// Stop the pool and tear down every queued slot.
    ///
    /// Slots held by callers are left alone; putting them back afterwards
    /// tears them down. Calling `close` again is a no-op.
    pub async fn close(&self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.close_inner()
            .instrument(tracing::info_span!("netpool_close"))
            .await
    }

    async fn close_inner(&self) -> Result<(), PoolError> {
        tracing::info!("Closing network slot pool");
        self.inner.lifetime.cancel();

        if let Some(handle) = self.populate.lock().await.take()
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Populate task failed");
        }
        self.inner.allocator.close();

        let mut errors = Vec::new();

        {
            let mut new = self.inner.new_rx.lock().await;
            while let Some(slot) = new.recv().await {
                self.inner.metrics.new_slots.dec();
                if let Err(e) = self.teardown(slot).await {
                    errors.push(e);
                }
            }
        }

        {
            let mut reused = self.inner.reused_rx.lock().await;
            reused.close();
            while let Some(slot) = reused.recv().await {
                self.inner.metrics.reused_slots.dec();
                if let Err(e) = self.teardown(slot).await {
                    errors.push(e);
                }
            }
        }

        let result = PoolError::from_many(errors);
        match &result {
            Ok(()) => tracing::info!("Network slot pool closed"),
            Err(e) => tracing::error!(error = %e, "Network slot pool closed with errors"),
        }
        result
    }
}

impl Drop for NetworkPool {
    fn drop(&mut self) {
        self.inner.lifetime.cancel();
    }
}

/// Run `f` with the calling thread inside the slot's namespace.
fn in_slot_namespace(
    ops: &dyn NetOps,
    slot: &mut Slot,
    f: impl FnOnce(&dyn NetOps, &mut Slot) -> Result<(), NetworkError>,
) -> Result<(), NetworkError> {
    let _guard = enter_slot_namespace(ops, slot)?;
    f(ops, slot)
}

/// Bring a dequeued slot to "firewall ready" and apply the internet policy.
///
/// Runs on the namespace worker. On failure the slot's resources are already
/// cleaned up; only the identity remains to be released.
fn prepare(ops: &dyn NetOps, slot: &mut Slot, egress: &str, allow_internet: bool) -> Result<(), PrepareFailure> {
    let idx = slot.idx();
    let namespace = slot.namespace_id();

    // The marker can disappear between this check and its use; the create
    // path repairs whatever it finds.
    let exists = match ops.namespace_exists(&namespace) {
        Ok(exists) => exists,
        Err(source) => {
            let teardown = remove_network(ops, slot, egress).err();
            return Err(PrepareFailure::Probe { source, teardown });
        }
    };

    if !exists {
        tracing::info!(slot = idx, namespace = %namespace, "Creating network on demand");
        if let Err(e) = reap_dangling(ops, slot, egress) {
            tracing::warn!(slot = idx, error = %e, "Failed to clean up dangling resources before create");
        }
        if let Err(source) = create_network(ops, slot, egress) {
            let cleanup = reap_dangling(ops, slot, egress).err();
            return Err(PrepareFailure::Create { source, cleanup });
        }
    } else if !slot.has_firewall() {
        tracing::info!(slot = idx, namespace = %namespace, "Namespace exists without firewall, initializing");
        if let Err(source) = in_slot_namespace(ops, slot, firewall::initialize) {
            let teardown = remove_network(ops, slot, egress).err();
            return Err(PrepareFailure::Firewall { source, teardown });
        }
    }

    if let Err(source) = in_slot_namespace(ops, slot, |ops, slot| {
        firewall::configure_internet(ops, slot, allow_internet)
    }) {
        let teardown = remove_network(ops, slot, egress).err();
        return Err(PrepareFailure::Firewall { source, teardown });
    }
    Ok(())
}

fn teardown_error(
    idx: u32,
    teardown: Option<NetworkError>,
    release: Option<AllocatorError>,
) -> Option<Box<PoolError>> {
    let mut errors = Vec::new();
    if let Some(source) = teardown {
        errors.push(PoolError::Teardown { idx, source });
    }
    if let Some(e) = release {
        errors.push(PoolError::Acquire(e));
    }
    PoolError::from_many(errors).err().map(Box::new)
}

/// Keep the "new" queue full. Identities are acquired here and released on
/// shutdown if they never made it into the queue.
async fn populate(inner: Arc<PoolInner>, new_tx: mpsc::Sender<Slot>, backoff_base: Duration) {
    tracing::debug!("Populate task started");
    let mut attempt: u32 = 0;

    loop {
        let slot = match inner.allocator.acquire(&inner.lifetime).await {
            Ok(slot) => {
                attempt = 0;
                slot
            }
            Err(AllocatorError::Cancelled) => break,
            Err(e) => {
                let backoff = jittered_backoff(backoff_base, attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!(
                    error = %e,
                    attempt,
                    backoff_ms = backoff.as_millis(),
                    "Failed to acquire slot identity, retrying"
                );
                tokio::select! {
                    biased;
                    _ = inner.lifetime.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        let idx = slot.idx();
        let permit = tokio::select! {
            biased;
            _ = inner.lifetime.cancelled() => None,
            permit = new_tx.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => {
                inner.metrics.new_slots.inc();
                permit.send(slot);
                tracing::trace!(slot = idx, "Slot identity queued");
            }
            None => {
                drop(slot);
                if let Err(e) = inner.allocator.release(idx) {
                    tracing::error!(slot = idx, error = %e, "Failed to release unqueued identity");
                }
                break;
            }
        }
    }

    tracing::debug!("Populate task stopped");
}

/// Exponential backoff capped at 2^10 times the base, scaled by a random
/// factor in `[0.5, 1.0]`.
fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base * (1u32 << attempt.min(10));
    exp.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
}
