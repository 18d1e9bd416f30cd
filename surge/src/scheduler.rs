//! Constant-arrival-rate scheduling.
//!
//! Every deadline is computed from the run start (`start + n·period`), never
//! from the previous emission, so execution jitter cannot accumulate into
//! schedule drift. A late wakeup emits all due iterations immediately and
//! re-aligns.

use crate::body::IterationBody;
use crate::metrics::Registry;
use crate::pool::VuPool;
use std::num::NonZeroU32;
use std::time::Duration;
use surge_core::{Iteration, ScenarioConfig, DROPPED_ITERATIONS};
use tokio::sync::watch;
use tokio::time::Instant;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

pub(crate) struct ArrivalSchedule {
    start: Instant,
    period: Duration,
    seq: u64,
}

impl ArrivalSchedule {
    pub fn new(rate: NonZeroU32, time_unit: Duration) -> Self {
        Self {
            start: Instant::now(),
            period: time_unit / rate.get(),
            seq: 0,
        }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Target time of the nth iteration start, anchored to the run start.
    fn deadline(&self, seq: u64) -> Instant {
        let nanos = (self.period.as_nanos() as u64).saturating_mul(seq);
        self.start + Duration::from_nanos(nanos)
    }

    /// Wait for the next scheduled start and return its iteration.
    ///
    /// Returns immediately for deadlines already in the past, which is what
    /// lets the schedule catch up after a stall.
    pub async fn next(&mut self) -> Iteration {
        let deadline = self.deadline(self.seq);
        tokio::time::sleep_until(deadline).await;

        let iteration = Iteration::new(self.seq, deadline.into_std());
        self.seq += 1;
        iteration
    }

    pub fn emitted(&self) -> u64 {
        self.seq
    }
}

/// Drive the arrival schedule against the pool until the configured
/// duration of starts has been emitted or a stop is signalled.
///
/// Returns the pool so the caller can wait out in-flight iterations.
pub(crate) async fn drive<B>(
    config: ScenarioConfig,
    mut pool: VuPool<B>,
    registry: Registry,
    mut stop: watch::Receiver<bool>,
) -> VuPool<B>
where
    B: IterationBody + Clone,
{
    let mut schedule = ArrivalSchedule::new(config.rate, config.time_unit);
    let end = (schedule.start() + config.duration).into_std();
    let dropped = registry.counter(DROPPED_ITERATIONS);
    let mut warned = false;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => {
                debug!("schedule stopped early");
                break;
            }
            iteration = schedule.next() => {
                // The schedule covers [start, start + duration).
                if iteration.scheduled_at >= end {
                    break;
                }

                if pool.dispatch(iteration).is_err() {
                    dropped.increment();
                    if !warned {
                        warned = true;
                        warn!(
                            "virtual user pool exhausted (max_vus = {}): dropping scheduled \
                             iterations. Sustaining {}/{} needs roughly rate x iteration \
                             latency virtual users; raise max_vus or lower the rate",
                            config.max_vus(),
                            config.rate,
                            humantime::format_duration(config.time_unit),
                        );
                    }
                }
            }
        }
    }

    debug!(
        "schedule complete: {} iterations emitted, {} dropped",
        schedule.emitted(),
        dropped.value(),
    );
    pool
}
