//! Scenario run loop: wires the scheduler, pool, registry and threshold
//! evaluation together.

use crate::body::IterationBody;
use crate::error::ScenarioError;
use crate::executor::HttpClient;
use crate::metrics::Registry;
use crate::pool::VuPool;
use crate::scheduler;
use std::time::{Duration, Instant};
use surge_core::{
    RunSummary, ScenarioConfig, Threshold, ThresholdVerdict, Verdict, CHECKS, DROPPED_ITERATIONS,
    HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, ITERATIONS, ITERATION_DURATION, VUS, VUS_MAX,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

const COLLECT_INTERVAL: Duration = Duration::from_millis(500);

#[instrument(name = "scenario", skip_all, fields(name = config.name))]
pub(crate) async fn run_scenario<B>(
    body: B,
    config: ScenarioConfig,
) -> Result<RunSummary, ScenarioError>
where
    B: IterationBody + Clone,
{
    config.validate()?;
    let thresholds = config.compiled_thresholds()?;

    info!("running {} with config {:?}", config.name, config);
    let started = Instant::now();

    let registry = Registry::new();
    register_builtins(&registry);
    let http = HttpClient::new(&registry, config.base_url.as_deref(), config.request_timeout)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let pool = VuPool::new(body, &config, registry.clone(), http, stop_rx.clone());

    let mut driver = tokio::spawn(scheduler::drive(
        config.clone(),
        pool,
        registry.clone(),
        stop_rx,
    ));

    // NOTE: This loop shares time with the scheduler; keep each tick cheap.
    let abort: Vec<&Threshold> = thresholds.iter().filter(|t| t.abort_on_fail).collect();
    let mut interval = tokio::time::interval(COLLECT_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let pool = loop {
        tokio::select! {
            result = &mut driver => {
                match result {
                    Ok(pool) => break pool,
                    Err(err) => std::panic::resume_unwind(err.into_panic()),
                }
            }
            _ = interval.tick() => {
                let snapshot = registry.snapshot();
                if started.elapsed() < config.delay_abort_eval {
                    continue;
                }
                let violated = abort.iter().find(|threshold| {
                    threshold
                        .expr
                        .evaluate(&threshold.metric, snapshot.get(&threshold.metric))
                        .verdict
                        == Verdict::Failed
                });
                if let Some(threshold) = violated {
                    warn!("threshold '{threshold}' violated mid-run; stopping scenario");
                    let _ = stop_tx.send(true);
                }
            }
        }
    };

    // Schedule is done; let in-flight iterations finish, bounded by the
    // graceful stop.
    let _ = stop_tx.send(true);
    let vus_spawned = pool.spawned();
    pool.shutdown(config.graceful_stop).await;

    let snapshot = registry.snapshot();
    let verdicts = thresholds
        .into_iter()
        .map(|threshold| {
            let eval = threshold
                .expr
                .evaluate(&threshold.metric, snapshot.get(&threshold.metric));
            if eval.verdict == Verdict::Failed {
                warn!("threshold failed: {threshold}");
            }
            ThresholdVerdict {
                threshold,
                verdict: eval.verdict,
                observed: eval.observed,
            }
        })
        .collect();

    let summary = RunSummary {
        scenario: config.name.clone(),
        elapsed: started.elapsed(),
        vus_spawned,
        snapshot: (*snapshot).clone(),
        verdicts,
        trend_stats: config.summary_trend_stats.clone(),
    };
    info!("scenario complete: {} iterations", summary.iterations());
    Ok(summary)
}

/// Register the built-in metrics up front so kinds are fixed and every run
/// summary carries the full set, recorded or not.
fn register_builtins(registry: &Registry) {
    registry.counter(ITERATIONS);
    registry.trend(ITERATION_DURATION);
    registry.counter(DROPPED_ITERATIONS);
    registry.counter(HTTP_REQS);
    registry.trend(HTTP_REQ_DURATION);
    registry.rate(HTTP_REQ_FAILED);
    registry.rate(CHECKS);
    registry.gauge(VUS);
    registry.gauge(VUS_MAX);
}
