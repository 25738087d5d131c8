//! Serialized escrow-creation queue
//!
//! Escrow creations for one signing account must consume strictly increasing
//! sequence numbers with no gaps; preparing two creations concurrently
//! corrupts the assignment. The queue chains jobs through a single worker
//! task so one creation is fully prepared, signed, submitted and validated
//! before the next begins preparation.
//!
//! Finish, cancel and message submissions do not allocate new escrow
//! sequences the same way and bypass this queue.

use crate::errors::PluginError;
use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone)]
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Spawn the worker task. Must be called inside a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("submission queue drained and closed");
        });
        Self { tx }
    }

    /// Run `fut` after every previously enqueued job has fully completed,
    /// returning its output. Strictly FIFO.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, PluginError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(fut.await);
        });
        self.tx
            .send(job)
            .map_err(|_| PluginError::Internal("submission queue closed".into()))?;
        done_rx
            .await
            .map_err(|_| PluginError::Internal("submission queue dropped job".into()))
    }
}
