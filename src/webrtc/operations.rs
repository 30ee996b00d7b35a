//! Serial executor for engine operations
//!
//! Offer/answer and candidate operations are fire-and-forget from the
//! session's point of view: the session pushes an operation and keeps
//! processing messages, and the operation posts its result back as a
//! completion. Operations still have to reach the engine in the order they
//! were issued (a remote description before the candidates that follow it),
//! so they run one at a time on a dedicated task.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

pub struct OperationsChain {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    worker: JoinHandle<()>,
}

impl OperationsChain {
    /// Start the worker task
    pub fn spawn(client_id: u64) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();

        let worker = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                op.await;
            }
            trace!("Operations chain for client {} drained", client_id);
        });

        Self { tx, worker }
    }

    /// Queue `op` behind every operation pushed before it
    pub fn push<F>(&self, op: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.send(op.boxed()).is_ok()
    }
}

impl Drop for OperationsChain {
    fn drop(&mut self) {
        // Pending completions target a session that no longer exists
        self.worker.abort();
    }
}
