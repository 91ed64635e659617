//! Single-consumer dispatch queue.
//!
//! Producers on any thread push one-shot [`Job`]s; exactly one consumer task
//! periodically drains and executes them in FIFO order. Draining detaches the
//! whole pending list under the lock, so producers racing with a drain append
//! to a fresh list instead of the one being iterated.

use {
    parking_lot::Mutex,
    std::collections::VecDeque,
    std::sync::atomic::{AtomicBool, Ordering},
    std::sync::Arc,
    std::time::Duration,
    tokio::sync::Notify,
    tokio_util::sync::CancellationToken,
};

/// Cross-thread wait/wake primitive.
///
/// `set` stores a wake permit, so a `set` with no waiter makes the next
/// `wait` return immediately. Multiple `set` calls before a `wait` coalesce
/// into a single wake.
#[derive(Default)]
pub struct Signal {
    notify: Notify,
}

impl Signal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Callable from any thread, sync or async context.
    pub fn set(&self) {
        self.notify.notify_one();
    }

    /// Returns `true` if woken by `set`, `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

type JobFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// One-shot unit of deferred execution, tagged for diagnostics.
pub struct Job {
    tag: String,
    task: JobFn,
}

impl Job {
    /// Panics if `tag` is empty: work that cannot be identified in a failure
    /// log must not enter the queue.
    pub fn new<F>(tag: impl Into<String>, task: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let tag = tag.into();
        assert!(!tag.is_empty(), "job pushed without a diagnostic tag");
        Self {
            tag,
            task: Box::new(task),
        }
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Multi-producer, single-consumer work queue plus wake signal.
///
/// The pending list is the only structure in the crate mutated from multiple
/// threads without higher-level synchronization; everything else is
/// single-writer by construction of the scheduling model.
pub struct DispatchQueue {
    jobs: Mutex<VecDeque<Job>>,
    signal: Signal,
    draining: AtomicBool,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            signal: Signal::new(),
            draining: AtomicBool::new(false),
        }
    }

    /// Append a job and wake the consumer. Callable from any thread,
    /// including the consumer itself; blocks only for the lock critical
    /// section.
    pub fn push(&self, job: Job) {
        self.jobs.lock().push_back(job);
        self.signal.set();
    }

    /// Detach and execute the entire pending batch in FIFO order on the
    /// calling thread. A failing job is logged and skipped; the rest of the
    /// batch still runs. Returns the number of jobs executed.
    ///
    /// Panics if a drain is entered while another is in progress: two
    /// drains would destroy the ordering guarantee, and that is a defect,
    /// not a runtime condition.
    pub fn drain(&self) -> usize {
        assert!(
            !self.draining.swap(true, Ordering::Acquire),
            "dispatch drain entered while another drain is running"
        );
        let batch = std::mem::take(&mut *self.jobs.lock());
        let mut ran = 0usize;
        for job in batch {
            ran += 1;
            let Job { tag, task } = job;
            if let Err(err) = task() {
                tracing::error!(job = %tag, "dispatched job failed: {err:#}");
            }
        }
        self.draining.store(false, Ordering::Release);
        ran
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    #[must_use]
    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}

/// Consumer-loop helper: `drain`, then wait on the signal, repeated until
/// cancelled. All session-level mutation funnels through this loop.
pub struct Consumer {
    queue: Arc<DispatchQueue>,
    idle_wait: Duration,
}

impl Consumer {
    #[must_use]
    pub fn new(queue: Arc<DispatchQueue>, idle_wait: Duration) -> Self {
        Self { queue, idle_wait }
    }

    /// Run until `cancel` fires, with a final drain so jobs pushed during
    /// shutdown still execute.
    pub async fn run(&self, cancel: &CancellationToken) {
        loop {
            self.queue.drain();
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = self.queue.signal().wait(self.idle_wait) => {}
            }
        }
        self.queue.drain();
    }

    /// Drain until at least `min` jobs have executed or `timeout` passes.
    /// Returns the executed count.
    pub async fn join(&self, min: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ran = self.queue.drain();
        while ran < min {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            self.queue.signal().wait(deadline - now).await;
            ran += self.queue.drain();
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn drains_in_push_order() {
        let queue = DispatchQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = order.clone();
            queue.push(Job::new(label, move || {
                order.lock().push(label);
                Ok(())
            }));
        }
        assert_eq!(queue.drain(), 3);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn failing_job_does_not_stop_the_batch() {
        let queue = DispatchQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        queue.push(Job::new("boom", || Err(anyhow::anyhow!("boom"))));
        let flag = ran.clone();
        queue.push(Job::new("after", move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }));
        assert_eq!(queue.drain(), 2);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "diagnostic tag")]
    fn empty_tag_is_fatal() {
        let _ = Job::new("", || Ok(()));
    }

    #[tokio::test]
    async fn wakes_without_full_timeout() {
        let queue = Arc::new(DispatchQueue::new());
        let consumer = Consumer::new(queue.clone(), Duration::from_secs(30));

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                queue.push(Job::new("late", || Ok(())));
            })
        };

        let begun = Instant::now();
        let ran = consumer.join(1, Duration::from_secs(10)).await;
        assert_eq!(ran, 1);
        assert!(begun.elapsed() < Duration::from_secs(5));
        producer.join().expect("producer thread");
    }

    #[tokio::test]
    async fn exactly_once_under_concurrent_producers() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 250;

        let queue = Arc::new(DispatchQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..THREADS)
            .map(|_| {
                let queue = queue.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        let counter = counter.clone();
                        queue.push(Job::new("tick", move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }));
                    }
                })
            })
            .collect();

        let consumer = Consumer::new(queue.clone(), Duration::from_millis(10));
        let ran = consumer
            .join(THREADS * PER_THREAD, Duration::from_secs(10))
            .await;

        for producer in producers {
            producer.join().expect("producer thread");
        }
        assert_eq!(ran, THREADS * PER_THREAD);
        assert_eq!(counter.load(Ordering::SeqCst), THREADS * PER_THREAD);
        assert!(queue.is_empty());
    }
}
