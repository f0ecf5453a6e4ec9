//! Slot identity allocator.
//!
//! Hands out integer identities in `[0, capacity)`. `acquire` waits until one is
//! free; `release` rejects identities that are not currently held, so a double
//! release can never put the same identity in the free set twice.

use std::collections::HashSet;
use std::sync::Mutex as StdMutex;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::AllocatorError;
use crate::slot::Slot;

struct Identities {
    free: Vec<u32>,
    held: HashSet<u32>,
}

pub struct SlotAllocator {
    capacity: u32,
    identities: StdMutex<Identities>,
    /// One permit per free identity.
    permits: Semaphore,
}

impl SlotAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            identities: StdMutex::new(Identities {
                free: (0..capacity).collect(),
                held: HashSet::with_capacity(capacity as usize),
            }),
            permits: Semaphore::new(capacity as usize),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of identities currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free identity and wrap it in a [`Slot`] without network resources.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Slot, AllocatorError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AllocatorError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| AllocatorError::Closed)?,
        };
        // The permit is given back explicitly in `release`.
        permit.forget();

        let mut identities = self
            .identities
            .lock()
            .map_err(|_| AllocatorError::Closed)?;
        if identities.free.is_empty() {
            // Permits and the free set are only ever changed together.
            tracing::error!("Slot allocator permit granted with an empty free set");
            return Err(AllocatorError::Closed);
        }
        let pick = rand::thread_rng().gen_range(0..identities.free.len());
        let idx = identities.free.swap_remove(pick);
        identities.held.insert(idx);

        tracing::debug!(slot = idx, "Slot identity acquired");
        Ok(Slot::new(idx))
    }

    /// Return an identity to the free set.
    pub fn release(&self, idx: u32) -> Result<(), AllocatorError> {
        let mut identities = self
            .identities
            .lock()
            .map_err(|_| AllocatorError::Closed)?;
        if !identities.held.remove(&idx) {
            tracing::warn!(slot = idx, "Rejected release of slot identity that is not held");
            return Err(AllocatorError::NotHeld(idx));
        }
        identities.free.push(idx);
        drop(identities);

        self.permits.add_permits(1);
        tracing::debug!(slot = idx, "Slot identity released");
        Ok(())
    }

    /// Fail all current and future `acquire` calls.
    pub fn close(&self) {
        self.permits.close();
    }
}
