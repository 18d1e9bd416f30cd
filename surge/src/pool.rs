//! Bounded, elastic pool of virtual users.
//!
//! Workers are tokio tasks that pull assigned iterations from a personal
//! mailbox and re-register themselves in an idle queue after each one, so a
//! warm worker (and its share of the pooled connections) is reused before
//! anything new is spawned. Growth is monotonic up to `max_vus`; a worker is
//! never torn down mid-iteration.

use crate::body::{IterationBody, VuContext};
use crate::executor::HttpClient;
use crate::metrics::{Counter, Gauge, Registry, Trend};
use async_channel::{Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};
use surge_core::{Iteration, ScenarioConfig, ITERATIONS, ITERATION_DURATION, VUS, VUS_MAX};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
#[error("no idle virtual user and the pool is at max_vus")]
pub(crate) struct PoolExhausted;

pub(crate) struct VuPool<B> {
    body: B,
    shared: WorkerShared,
    idle_tx: Sender<VuHandle>,
    idle_rx: Receiver<VuHandle>,
    tasks: Vec<JoinHandle<()>>,
    max_vus: usize,
    vus: Gauge,
}

/// Everything a worker needs besides its own channels.
#[derive(Clone)]
struct WorkerShared {
    http: HttpClient,
    metrics: Registry,
    iterations: Counter,
    iteration_duration: Trend,
    pacing: Option<Duration>,
    stop: watch::Receiver<bool>,
}

struct VuHandle {
    vu_id: usize,
    mailbox: mpsc::Sender<Iteration>,
}

impl<B> VuPool<B>
where
    B: IterationBody + Clone,
{
    pub fn new(
        body: B,
        config: &ScenarioConfig,
        metrics: Registry,
        http: HttpClient,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let max_vus = config.max_vus();
        let (idle_tx, idle_rx) = async_channel::bounded(max_vus);

        let shared = WorkerShared {
            http,
            iterations: metrics.counter(ITERATIONS),
            iteration_duration: metrics.trend(ITERATION_DURATION),
            metrics,
            pacing: config.pacing,
            stop,
        };
        shared.metrics.gauge(VUS_MAX).set(max_vus as f64);

        let vus = shared.metrics.gauge(VUS);
        let mut pool = Self {
            body,
            shared,
            idle_tx,
            idle_rx,
            tasks: Vec::with_capacity(config.pre_allocated_vus),
            max_vus,
            vus,
        };

        for _ in 0..config.pre_allocated_vus {
            let handle = pool.spawn_vu();
            // Cannot fail: the queue holds max_vus slots and at most one
            // handle circulates per worker.
            let _ = pool.idle_tx.try_send(handle);
        }
        pool
    }

    /// Assign an iteration to an idle virtual user, growing the pool if
    /// below the ceiling. Non-blocking: the arrival schedule must not stall
    /// behind a saturated pool.
    pub fn dispatch(&mut self, mut iteration: Iteration) -> Result<(), PoolExhausted> {
        loop {
            match self.idle_rx.try_recv() {
                Ok(handle) => {
                    iteration.vu = Some(handle.vu_id);
                    match handle.mailbox.try_send(iteration) {
                        Ok(()) => return Ok(()),
                        // Worker exited between registering and now; try the
                        // next idle handle.
                        Err(err) => iteration = err.into_inner(),
                    }
                }
                Err(TryRecvError::Empty) => {
                    if self.tasks.len() < self.max_vus {
                        let handle = self.spawn_vu();
                        iteration.vu = Some(handle.vu_id);
                        let _ = handle.mailbox.try_send(iteration);
                        return Ok(());
                    }
                    return Err(PoolExhausted);
                }
                Err(TryRecvError::Closed) => return Err(PoolExhausted),
            }
        }
    }

    fn spawn_vu(&mut self) -> VuHandle {
        let vu_id = self.tasks.len();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(1);

        let worker = Worker {
            vu_id,
            mailbox: mailbox_tx.clone(),
            mailbox_rx,
            idle: self.idle_tx.clone(),
            shared: self.shared.clone(),
            body: self.body.clone(),
        };
        self.tasks.push(tokio::spawn(worker.run()));
        self.vus.set(self.tasks.len() as f64);
        trace!("spawned VU {vu_id}");

        VuHandle {
            vu_id,
            mailbox: mailbox_tx,
        }
    }

    /// Virtual users spawned over the lifetime of the pool.
    pub fn spawned(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for workers to finish their in-flight iterations and exit.
    ///
    /// The stop signal must already have been broadcast. Workers still busy
    /// past `graceful_stop` are aborted.
    pub async fn shutdown(mut self, graceful_stop: Duration) {
        self.idle_rx.close();

        let deadline = tokio::time::Instant::now() + graceful_stop;
        for (vu_id, mut task) in self.tasks.drain(..).enumerate() {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("VU {vu_id} still busy after graceful stop; aborting");
                    task.abort();
                }
            }
        }
    }
}

struct Worker<B> {
    vu_id: usize,
    mailbox: mpsc::Sender<Iteration>,
    mailbox_rx: mpsc::Receiver<Iteration>,
    idle: Sender<VuHandle>,
    shared: WorkerShared,
    body: B,
}

impl<B> Worker<B>
where
    B: IterationBody,
{
    async fn run(mut self) {
        let mut stop = self.shared.stop.clone();
        loop {
            tokio::select! {
                biased;
                iteration = self.mailbox_rx.recv() => {
                    let Some(iteration) = iteration else { break };
                    self.run_iteration(iteration).await;

                    if let Some(pacing) = self.shared.pacing {
                        if !*stop.borrow() {
                            tokio::time::sleep(pacing).await;
                        }
                    }

                    let handle = VuHandle {
                        vu_id: self.vu_id,
                        mailbox: self.mailbox.clone(),
                    };
                    if self.idle.send(handle).await.is_err() {
                        break;
                    }
                }
                _ = stop.changed() => break,
            }
        }
        trace!("VU {} stopped", self.vu_id);
    }

    async fn run_iteration(&self, iteration: Iteration) {
        let ctx = VuContext {
            vu_id: self.vu_id,
            iteration: iteration.seq,
            http: self.shared.http.clone(),
            metrics: self.shared.metrics.clone(),
        };

        let started = Instant::now();
        let result = self.body.run_iteration(ctx).await;
        let elapsed = started.elapsed();

        self.shared.iterations.increment();
        self.shared
            .iteration_duration
            .record(elapsed.as_secs_f64() * 1e3);

        if result.failed() {
            trace!("iteration {} failed on VU {}", iteration.seq, self.vu_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config(pre: usize, max: usize) -> ScenarioConfig {
        let mut config = ScenarioConfig::new("pool-test");
        config.rate = NonZeroU32::new(100).unwrap();
        config.duration = Duration::from_secs(1);
        config.pre_allocated_vus = pre;
        config.max_vus = max;
        config
    }

    fn harness<B>(
        body: B,
        pre: usize,
        max: usize,
    ) -> (Registry, VuPool<B>, watch::Sender<bool>)
    where
        B: IterationBody + Clone,
    {
        let registry = Registry::new();
        let http = HttpClient::new(&registry, None, Duration::from_secs(1)).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let pool = VuPool::new(body, &config(pre, max), registry.clone(), http, stop_rx);
        (registry, pool, stop_tx)
    }

    fn iteration(seq: u64) -> Iteration {
        Iteration::new(seq, Instant::now())
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn grows_to_ceiling_then_reports_exhaustion() {
        let body = |_ctx: VuContext| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        };
        let (_registry, mut pool, stop_tx) = harness(body, 1, 2);
        assert_eq!(pool.spawned(), 1);

        assert!(pool.dispatch(iteration(0)).is_ok());
        assert!(pool.dispatch(iteration(1)).is_ok());
        assert_eq!(pool.spawned(), 2);

        assert!(pool.dispatch(iteration(2)).is_err());

        stop_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn idle_workers_are_reused() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let body = move |_ctx: VuContext| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::Relaxed);
            }
        };
        let (registry, mut pool, stop_tx) = harness(body, 1, 10);

        for seq in 0..5 {
            assert!(pool.dispatch(iteration(seq)).is_ok());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(pool.spawned(), 1, "idle worker should be reused");
        assert_eq!(counter.load(Ordering::Relaxed), 5);
        assert_eq!(registry.snapshot().counter(ITERATIONS), 5);

        stop_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn in_flight_iteration_finishes_before_stop() {
        let body = |_ctx: VuContext| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        };
        let (registry, mut pool, stop_tx) = harness(body, 1, 1);

        assert!(pool.dispatch(iteration(0)).is_ok());
        // Signal stop while the iteration is still running.
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;

        assert_eq!(registry.snapshot().counter(ITERATIONS), 1);
    }

    #[tokio::test]
    async fn stuck_worker_is_aborted_after_graceful_stop() {
        let body = |_ctx: VuContext| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        };
        let (registry, mut pool, stop_tx) = harness(body, 1, 1);

        assert!(pool.dispatch(iteration(0)).is_ok());
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop_tx.send(true).unwrap();

        let started = Instant::now();
        pool.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(registry.snapshot().counter(ITERATIONS), 0);
    }

    #[tokio::test]
    async fn jittered_bodies_feed_the_duration_trend() {
        use rand_distr::{Distribution, SkewNormal};
        use surge_core::{MetricValue, ITERATION_DURATION};

        let body = |_ctx: VuContext| async {
            let normal = SkewNormal::new(0.002, 0.001, 20.).unwrap();
            let jitter: f64 = normal.sample(&mut rand::thread_rng()).max(0.);
            tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
        };
        let (registry, mut pool, stop_tx) = harness(body, 1, 1);

        for seq in 0..10 {
            assert!(pool.dispatch(iteration(seq)).is_ok());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stop_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;

        let snapshot = registry.snapshot();
        let Some(MetricValue::Trend(durations)) = snapshot.get(ITERATION_DURATION) else {
            panic!("missing iteration_duration trend");
        };
        assert_eq!(durations.count(), 10);
        assert!(durations.avg() > 0.);
        assert!(durations.max() >= durations.min());
    }
}
