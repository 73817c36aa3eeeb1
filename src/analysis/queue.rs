//! Bounded hand-off between proposal creation and background analysis.
//!
//! `create` enqueues an `AnalysisJob` and returns immediately. A fixed pool
//! of workers drains the queue and calls `ProposalManager::analyze`. When the
//! queue is full the job is rejected and the proposal stays pending.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::proposals::ProposalManager;

/// A request to analyze one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisJob {
    pub proposal_id: Uuid,
}

/// Sending side of the analysis queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AnalysisQueue {
    tx: mpsc::Sender<AnalysisJob>,
}

/// Receiving side, shared by all workers.
pub type AnalysisReceiver = Arc<Mutex<mpsc::Receiver<AnalysisJob>>>;

impl AnalysisQueue {
    /// Create a queue holding at most `capacity` waiting jobs.
    pub fn bounded(capacity: usize) -> (Self, AnalysisReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, Arc::new(Mutex::new(rx)))
    }

    /// Enqueue without waiting. Rejects when full.
    pub fn enqueue(&self, proposal_id: Uuid) -> Result<(), QueueError> {
        match self.tx.try_send(AnalysisJob { proposal_id }) {
            Ok(()) => {
                debug!(proposal_id = %proposal_id, "Analysis job queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::Full { proposal_id }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    /// Jobs that can still be queued before rejection.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Running worker pool.
pub struct AnalysisWorkers {
    handles: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl AnalysisWorkers {
    /// Signal all workers to stop after their current job and wait for them.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Analysis worker ended abnormally");
            }
        }
        info!("Analysis workers stopped");
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Start `workers` tasks consuming `receiver`.
///
/// Workers run until `AnalysisWorkers::shutdown`. The manager they share
/// owns an `AnalysisQueue` sender, so the channel never closes under them.
pub fn spawn_analysis_workers(
    manager: Arc<ProposalManager>,
    receiver: AnalysisReceiver,
    workers: usize,
) -> AnalysisWorkers {
    let (stop, stop_rx) = watch::channel(false);
    let workers = workers.max(1);

    let handles = (0..workers)
        .map(|worker_id| {
            let manager = Arc::clone(&manager);
            let receiver = Arc::clone(&receiver);
            let stop_rx = stop_rx.clone();
            tokio::spawn(run_worker(worker_id, manager, receiver, stop_rx))
        })
        .collect();

    info!(workers, "Analysis workers started");
    AnalysisWorkers { handles, stop }
}

async fn run_worker(
    worker_id: usize,
    manager: Arc<ProposalManager>,
    receiver: AnalysisReceiver,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        let job = tokio::select! {
            job = async { receiver.lock().await.recv().await } => job,
            _ = stop.changed() => None,
        };
        let Some(job) = job else {
            break;
        };

        match manager.analyze(job.proposal_id).await {
            Ok(proposal) => debug!(
                worker_id,
                proposal_id = %proposal.id,
                score = ?proposal.score,
                "Background analysis complete"
            ),
            Err(e) => warn!(
                worker_id,
                proposal_id = %job.proposal_id,
                error = %e,
                "Background analysis failed"
            ),
        }
    }
    debug!(worker_id, "Analysis worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_when_full() {
        let (queue, _rx) = AnalysisQueue::bounded(1);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.enqueue(first).unwrap();
        assert_eq!(queue.remaining_capacity(), 0);
        let err = queue.enqueue(second).unwrap_err();
        assert!(matches!(err, QueueError::Full { proposal_id } if proposal_id == second));
    }

    #[tokio::test]
    async fn closed_queue_reports_closed() {
        let (queue, rx) = AnalysisQueue::bounded(4);
        drop(rx);
        assert!(matches!(queue.enqueue(Uuid::new_v4()), Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn jobs_arrive_in_order() {
        let (queue, rx) = AnalysisQueue::bounded(4);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.enqueue(*id).unwrap();
        }
        let mut rx = rx.lock().await;
        for id in ids {
            assert_eq!(rx.recv().await.map(|j| j.proposal_id), Some(id));
        }
    }
}
