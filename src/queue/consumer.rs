use std::{
    fmt::Display,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicBool, Ordering},
};

use futures::{FutureExt as _, future::join_all};
use tracing::{debug, error, warn};

use super::{Job, JobId, JobQueue, TileJob};

/// Drives `concurrency` independent fetch/process/acknowledge loops.
///
/// Loops run cooperatively on the calling task. Jobs within one loop are
/// handled strictly one after another.
pub struct Consumer<Q> {
    queue: Q,
    concurrency: usize,
    stopping: AtomicBool,
}

enum WorkerState {
    Fetching,
    Processing(Job),
    Acknowledging {
        id: JobId,
        outcome: Result<(), String>,
    },
    Done,
}

impl<Q: JobQueue> Consumer<Q> {
    pub fn new(queue: Q, concurrency: usize) -> Self {
        Self {
            queue,
            concurrency: concurrency.max(1),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Stop issuing new fetches. Jobs already in flight run to completion.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Consume jobs until every loop has observed an empty queue.
    ///
    /// Returns the number of jobs acknowledged. Handler errors and panics are
    /// reported to the queue and never end a loop; queue errors stop all loops
    /// and are returned once in-flight jobs have settled.
    pub async fn consume<F, Fut, O, E>(&self, handler: F) -> Result<usize, Q::Error>
    where
        F: Fn(TileJob) -> Fut,
        Fut: Future<Output = Result<O, E>>,
        E: Display,
    {
        let workers = (0..self.concurrency).map(|worker| self.run_worker(worker, &handler));
        let mut handled = 0;
        let mut failure = None;
        for result in join_all(workers).await {
            match result {
                Ok(count) => handled += count,
                Err(error) if failure.is_none() => failure = Some(error),
                Err(_) => {}
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(handled),
        }
    }

    async fn run_worker<F, Fut, O, E>(&self, worker: usize, handler: &F) -> Result<usize, Q::Error>
    where
        F: Fn(TileJob) -> Fut,
        Fut: Future<Output = Result<O, E>>,
        E: Display,
    {
        let mut handled = 0;
        let mut state = WorkerState::Fetching;
        loop {
            state = match state {
                WorkerState::Fetching if self.is_stopping() => WorkerState::Done,
                WorkerState::Fetching => match self.queue.fetch().await {
                    Ok(Some(job)) => WorkerState::Processing(job),
                    Ok(None) => {
                        debug!(worker, "queue drained");
                        WorkerState::Done
                    }
                    Err(error) => {
                        error!(worker, %error, "failed to fetch job");
                        self.stop();
                        return Err(error);
                    }
                },
                WorkerState::Processing(job) => {
                    debug!(worker, id = job.id, tile = %job.data.tile, "processing job");
                    let outcome = match AssertUnwindSafe(handler(job.data)).catch_unwind().await {
                        Ok(result) => result.map(|_| ()).map_err(|error| error.to_string()),
                        Err(_) => Err("job handler panicked".to_owned()),
                    };
                    WorkerState::Acknowledging {
                        id: job.id,
                        outcome,
                    }
                }
                WorkerState::Acknowledging { id, outcome } => {
                    let ack = match &outcome {
                        Ok(()) => self.queue.complete(id).await,
                        Err(message) => {
                            warn!(worker, id, error = message.as_str(), "job failed");
                            self.queue.fail(id, message).await
                        }
                    };
                    if let Err(error) = ack {
                        error!(worker, id, %error, "failed to acknowledge job");
                        self.stop();
                        return Err(error);
                    }
                    handled += 1;
                    WorkerState::Fetching
                }
                WorkerState::Done => return Ok(handled),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::sync::Mutex;

    use super::*;
    use crate::grid::Tile;

    #[derive(Debug, thiserror::Error)]
    #[error("queue unavailable")]
    struct Unavailable;

    #[derive(Default)]
    struct MemoryQueue {
        pending: Mutex<VecDeque<Job>>,
        completed: Mutex<Vec<JobId>>,
        failed: Mutex<HashMap<JobId, String>>,
        fail_fetch_after: Option<usize>,
        fail_ack: bool,
        fetches: AtomicUsize,
    }

    impl MemoryQueue {
        fn with_jobs(count: usize) -> Self {
            let pending = (0..count)
                .map(|i| Job {
                    id: i as JobId,
                    data: TileJob::new(Tile::new(10, i as u32, 0)),
                })
                .collect();
            Self {
                pending: Mutex::new(pending),
                ..Default::default()
            }
        }
    }

    impl JobQueue for MemoryQueue {
        type Error = Unavailable;

        async fn fetch(&self) -> Result<Option<Job>, Self::Error> {
            let fetches = self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch_after.is_some_and(|limit| fetches >= limit) {
                return Err(Unavailable);
            }
            Ok(self.pending.lock().await.pop_front())
        }

        async fn complete(&self, id: JobId) -> Result<(), Self::Error> {
            if self.fail_ack {
                return Err(Unavailable);
            }
            self.completed.lock().await.push(id);
            Ok(())
        }

        async fn fail(&self, id: JobId, error: &str) -> Result<(), Self::Error> {
            if self.fail_ack {
                return Err(Unavailable);
            }
            self.failed.lock().await.insert(id, error.to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn drains_queue_and_reports_failures() {
        let consumer = Consumer::new(MemoryQueue::with_jobs(10), 3);
        let handled = consumer
            .consume(|job| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                if job.tile.x % 3 == 0 {
                    Err(format!("boom {}", job.tile.x))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(handled, 10);
        let queue = consumer.queue();
        let mut completed = queue.completed.lock().await.clone();
        completed.sort();
        assert_eq!(completed, vec![1, 2, 4, 5, 7, 8]);
        let failed = queue.failed.lock().await;
        assert_eq!(failed.len(), 4);
        assert_eq!(failed[&9], "boom 9");
    }

    #[tokio::test]
    async fn runs_loops_concurrently() {
        let consumer = Consumer::new(MemoryQueue::with_jobs(4), 4);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        consumer
            .consume(|_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .await
            .unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn empty_queue_resolves_immediately() {
        let consumer = Consumer::new(MemoryQueue::default(), 2);
        let handled = consumer
            .consume(|_| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert_eq!(handled, 0);
        assert_eq!(consumer.queue().fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_error_surfaces_after_in_flight_jobs() {
        let queue = MemoryQueue {
            fail_fetch_after: Some(3),
            ..MemoryQueue::with_jobs(10)
        };
        let consumer = Consumer::new(queue, 2);
        let result = consumer
            .consume(|_| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, String>(())
            })
            .await;
        assert!(result.is_err());
        assert!(consumer.is_stopping());
        // every leased job was acknowledged before consume returned
        assert_eq!(consumer.queue().completed.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn ack_error_stops_every_loop() {
        let queue = MemoryQueue {
            fail_ack: true,
            ..MemoryQueue::with_jobs(10)
        };
        let consumer = Consumer::new(queue, 2);
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let result = consumer
            .consume(move |job| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                if job.tile.x == 0 {
                    Err("boom")
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(Unavailable)));
        assert!(consumer.is_stopping());
        // each loop handled one job, then gave up on its acknowledgement
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(consumer.queue().pending.lock().await.len(), 8);
    }

    #[tokio::test]
    async fn panicking_handler_fails_only_its_job() {
        let consumer = Consumer::new(MemoryQueue::with_jobs(3), 1);
        let handled = consumer
            .consume(|job| async move {
                if job.tile.x == 1 {
                    panic!("bad tile");
                }
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(handled, 3);
        let queue = consumer.queue();
        assert_eq!(*queue.completed.lock().await, vec![0, 2]);
        assert_eq!(queue.failed.lock().await[&1], "job handler panicked");
    }

    #[tokio::test]
    async fn stop_lets_in_flight_jobs_finish() {
        let consumer = &Consumer::new(MemoryQueue::with_jobs(10), 2);
        let handled = consumer
            .consume(move |_| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                consumer.stop();
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(handled, 2);
        assert_eq!(consumer.queue().completed.lock().await.len(), 2);
        assert_eq!(consumer.queue().pending.lock().await.len(), 8);
    }
}
