/// Bounded worker pool feeding the pipeline.
///
/// Jobs flow through a bounded flume channel to a fixed set of workers.
/// Backpressure is the channel itself: submits wait when every worker is
/// busy and the queue is full.
use flume::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

use super::{run_chain, PipelineCtx};

/// One pipeline run for one task.
#[derive(Debug, Clone, Copy)]
pub struct Job {
    pub task_id: Uuid,
    /// Restart runs use the re-registration chain.
    pub restart: bool,
}

#[derive(Clone)]
pub struct PipelineQueue {
    tx: Sender<Job>,
}

impl PipelineQueue {
    /// Spawn the worker pool. The handles finish when the queue is
    /// dropped and drained.
    pub fn start(ctx: PipelineCtx, workers: usize, depth: usize) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = flume::bounded::<Job>(depth);

        let handles = (0..workers)
            .map(|worker| {
                let rx: Receiver<Job> = rx.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    debug!(worker, "pipeline worker started");
                    while let Ok(job) = rx.recv_async().await {
                        debug!(worker, task_id = %job.task_id, "job picked up");
                        run_chain(&ctx, job.task_id, job.restart).await;
                    }
                    debug!(worker, "pipeline worker stopped");
                })
            })
            .collect();

        info!(workers, depth, "pipeline queue started");
        (Self { tx }, handles)
    }

    /// Queue a task for a pipeline run, waiting for room if needed.
    pub async fn enqueue(&self, job: Job) -> Result<()> {
        self.tx
            .send_async(job)
            .await
            .map_err(|_| GatewayError::Invariant("pipeline queue is closed".into()))
    }

    /// Queue without waiting. Fails when the queue is full.
    pub fn try_enqueue(&self, job: Job) -> Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            flume::TrySendError::Full(_) => {
                GatewayError::Policy("pipeline queue is full".into())
            }
            flume::TrySendError::Disconnected(_) => {
                GatewayError::Invariant("pipeline queue is closed".into())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_enqueue_reports_full_queue() {
        let (tx, _rx) = flume::bounded::<Job>(1);
        let queue = PipelineQueue { tx };

        let job = Job {
            task_id: Uuid::new_v4(),
            restart: false,
        };
        queue.try_enqueue(job).unwrap();
        let err = queue.try_enqueue(job).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_enqueue_fails_when_workers_are_gone() {
        let (tx, rx) = flume::bounded::<Job>(1);
        drop(rx);
        let queue = PipelineQueue { tx };
        let err = queue
            .try_enqueue(Job {
                task_id: Uuid::new_v4(),
                restart: false,
            })
            .unwrap_err();
        assert!(matches!(err, GatewayError::Invariant(_)));
    }
}
