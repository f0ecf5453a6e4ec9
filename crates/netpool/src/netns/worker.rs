//! Dedicated thread for namespace-dependent work.
//!
//! Switching namespaces changes the state of the calling OS thread. Runtime
//! worker threads are shared by unrelated tasks, so every sequence that switches
//! namespaces runs here instead: one thread, one job at a time, each job run to
//! completion before the next starts.

use std::sync::mpsc;

use tokio::sync::oneshot;

use super::NetOps;
use crate::error::NetworkError;
use crate::slot::Slot;

type Job = Box<dyn FnOnce(&dyn NetOps) + Send>;

/// The thread exits once the worker is dropped and its queue drains.
pub struct NamespaceWorker {
    jobs: mpsc::Sender<Job>,
}

impl NamespaceWorker {
    pub fn spawn(ops: Box<dyn NetOps>) -> std::io::Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();

        std::thread::Builder::new()
            .name("netns-worker".to_string())
            .spawn(move || {
                tracing::debug!("Namespace worker started");
                while let Ok(job) = queue.recv() {
                    job(ops.as_ref());
                }
                tracing::debug!("Namespace worker stopped");
            })?;

        Ok(Self { jobs })
    }

    /// Run `f` on the worker thread and wait for its result.
    pub async fn run<T, F>(&self, f: F) -> Result<T, NetworkError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn NetOps) -> T + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move |ops| {
            let _ = result_tx.send(f(ops));
        });
        self.jobs.send(job).map_err(|_| NetworkError::WorkerGone)?;
        // A panicking job drops the sender without a value.
        result_rx.await.map_err(|_| NetworkError::WorkerGone)
    }

    /// Lend `slot` to a job on the worker thread and get it back with the result.
    ///
    /// On [`NetworkError::WorkerGone`] the slot is lost; callers keep its index
    /// to release the identity.
    pub async fn with_slot<T, F>(&self, mut slot: Slot, f: F) -> Result<(Slot, T), NetworkError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn NetOps, &mut Slot) -> T + Send + 'static,
    {
        self.run(move |ops| {
            let result = f(ops, &mut slot);
            (slot, result)
        })
        .await
    }
}
