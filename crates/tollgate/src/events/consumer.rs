use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Message;

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Arc<Message>);
}

/// Fixed pool of workers draining one subscription. No ordering across
/// workers; each worker handles messages in receipt order.
pub struct Consumer {
    name: &'static str,
    workers: Vec<JoinHandle<()>>,
}

impl Consumer {
    pub fn start(
        name: &'static str,
        rx: mpsc::Receiver<Arc<Message>>,
        handler: Arc<dyn MessageHandler>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                tokio::spawn(async move { run_worker(name, worker, rx, handler, cancel).await })
            })
            .collect::<Vec<_>>();
        info!(consumer = name, workers = workers.len(), "consumer started");
        Self { name, workers }
    }

    /// Wait for every worker to finish. Workers stop once the subscription
    /// is closed and drained, or when cancelled.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
        info!(consumer = self.name, "consumer stopped");
    }
}

async fn run_worker(
    name: &'static str,
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Arc<Message>>>>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    loop {
        let message = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                message = rx.recv() => message,
                _ = cancel.cancelled() => None,
            }
        };
        let Some(message) = message else {
            debug!(consumer = name, worker, "worker exiting");
            return;
        };
        handler.handle(message).await;
    }
}
