use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type Job = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Fixed set of workers draining a bounded FIFO queue. Submitting waits
/// while the queue is full; a failing job is logged and the worker moves on.
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(worker_num: usize, pool_size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(pool_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_num.max(1))
            .map(|id| tokio::spawn(run_worker(id, receiver.clone())))
            .collect();

        WorkerPool { sender, workers }
    }

    pub async fn put_job<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.sender
            .send(Box::pin(job))
            .await
            .map_err(|_| anyhow::anyhow!("worker pool is closed"))
    }

    /// Stops accepting jobs and waits until every queued and running job
    /// has finished.
    pub async fn close(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Worker task panicked: {}", e);
            }
        }
    }
}

async fn run_worker(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        if let Err(e) = job.await {
            warn!("Worker {} job failed: {:#}", id, e);
        }
    }
    debug!("Worker {} stopped", id);
}
