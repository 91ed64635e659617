//! Ordered execution lanes over the tokio runtime.
//!
//! A lane is one unbounded queue drained by one dedicated task: jobs
//! submitted to the same lane run strictly in submission order, while
//! distinct lanes interleave freely across the runtime's workers. Each
//! socket writer owns one lane for the life of its socket, which is what
//! keeps its wire output in acceptance order even though muxing and sending
//! happen off the consumer task.

use {
    dashmap::DashMap,
    futures::future::BoxFuture,
    std::future::Future,
    std::sync::atomic::{AtomicU64, Ordering},
    tokio::sync::mpsc,
};

/// Identifies one ordered lane. Ids are never reused within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaneId(u64);

impl std::fmt::Display for LaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lane-{}", self.0)
    }
}

struct LaneJob {
    tag: String,
    work: BoxFuture<'static, anyhow::Result<()>>,
}

/// Pool of ordered lanes. Must be used from within a tokio runtime:
/// `open_lane` spawns the lane's drainer task.
pub struct LanePool {
    lanes: DashMap<LaneId, mpsc::UnboundedSender<LaneJob>>,
    next_lane: AtomicU64,
}

impl Default for LanePool {
    fn default() -> Self {
        Self::new()
    }
}

impl LanePool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lanes: DashMap::new(),
            next_lane: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh lane and spawn its drainer.
    pub fn open_lane(&self) -> LaneId {
        let id = LaneId(self.next_lane.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let LaneJob { tag, work } = job;
                if let Err(err) = work.await {
                    tracing::error!(lane = %id, job = %tag, "lane job failed: {err:#}");
                }
            }
            tracing::debug!(lane = %id, "lane drained and closed");
        });
        self.lanes.insert(id, tx);
        id
    }

    /// Enqueue `work` on `lane`. Returns `false` if the lane is closed;
    /// a failing job is logged by the drainer and does not kill the lane.
    pub fn submit<F>(&self, lane: LaneId, tag: &str, work: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match self.lanes.get(&lane) {
            Some(tx) => tx
                .send(LaneJob {
                    tag: tag.to_owned(),
                    work: Box::pin(work),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Close a lane: already-queued jobs still run, then the drainer exits.
    /// Closing an unknown or already-closed lane is a no-op.
    pub fn close_lane(&self, lane: LaneId) {
        self.lanes.remove(&lane);
    }

    #[must_use]
    pub fn is_open(&self, lane: LaneId) -> bool {
        self.lanes.contains_key(&lane)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lanes_preserve_submission_order() {
        const LANES: usize = 4;
        const JOBS: u32 = 50;

        let pool = LanePool::new();
        let seen: Arc<Mutex<Vec<(LaneId, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut done = Vec::new();

        for _ in 0..LANES {
            let lane = pool.open_lane();
            for i in 0..JOBS {
                let seen = seen.clone();
                pool.submit(lane, "ordered", async move {
                    // yield to give the scheduler a chance to interleave lanes
                    tokio::task::yield_now().await;
                    seen.lock().push((lane, i));
                    Ok(())
                });
            }
            let (tx, rx) = oneshot::channel();
            pool.submit(lane, "done", async move {
                let _ = tx.send(());
                Ok(())
            });
            done.push(rx);
        }

        for rx in done {
            rx.await.expect("lane completion");
        }

        let seen = seen.lock();
        let mut last: std::collections::HashMap<LaneId, u32> = std::collections::HashMap::new();
        for (lane, i) in seen.iter() {
            if let Some(prev) = last.insert(*lane, *i) {
                assert!(prev < *i, "{lane} ran {i} after {prev}");
            }
        }
        assert_eq!(seen.len(), LANES * JOBS as usize);
    }

    #[tokio::test]
    async fn submit_to_closed_lane_is_rejected() {
        let pool = LanePool::new();
        let lane = pool.open_lane();
        assert!(pool.is_open(lane));
        pool.close_lane(lane);
        pool.close_lane(lane);
        assert!(!pool.submit(lane, "late", async { Ok(()) }));
    }

    #[tokio::test]
    async fn failed_job_does_not_kill_the_lane() {
        let pool = LanePool::new();
        let lane = pool.open_lane();
        pool.submit(lane, "boom", async { Err(anyhow::anyhow!("boom")) });
        let (tx, rx) = oneshot::channel();
        pool.submit(lane, "after", async move {
            let _ = tx.send(());
            Ok(())
        });
        rx.await.expect("lane survived the failure");
    }
}
