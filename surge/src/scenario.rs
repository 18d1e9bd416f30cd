//! Scenario handle and fluent configuration.

use crate::body::IterationBody;
use crate::error::ScenarioError;
use crate::runner::run_scenario;
use std::{
    future::Future,
    num::NonZeroU32,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use surge_core::{RunSummary, ScenarioConfig, TrendStat};

/// A configured load-test scenario.
///
/// Built with [`Scenario::new`] plus the fluent setters, then either
/// `.await`ed directly or run via [`Scenario::run`]; both resolve to the
/// [`RunSummary`] once the run (including its graceful stop) finishes.
///
/// ```no_run
/// use surge::prelude::*;
/// use std::num::NonZeroU32;
/// use std::time::Duration;
///
/// # async fn example() {
/// let summary = Scenario::new("smoke", |ctx: VuContext| async move {
///     ctx.http().get("/healthz").send().await;
/// })
/// .base_url("http://localhost:8080")
/// .rate(NonZeroU32::new(50).unwrap())
/// .duration(Duration::from_secs(10))
/// .run()
/// .await
/// .unwrap();
/// assert!(summary.passed());
/// # }
/// ```
#[pin_project::pin_project]
pub struct Scenario<B> {
    body: B,
    config: ScenarioConfig,
    runner_fut: Option<Pin<Box<dyn Future<Output = Result<RunSummary, ScenarioError>> + Send>>>,
}

impl<B> Scenario<B>
where
    B: IterationBody + Clone,
{
    pub fn new(name: &str, body: B) -> Self {
        Self {
            body,
            config: ScenarioConfig::new(name),
            runner_fut: None,
        }
    }

    /// Iteration starts per [`Scenario::time_unit`].
    pub fn rate(mut self, rate: NonZeroU32) -> Self {
        self.config.rate = rate;
        self
    }

    /// Window the rate applies to. Defaults to one second.
    pub fn time_unit(mut self, time_unit: Duration) -> Self {
        self.config.time_unit = time_unit;
        self
    }

    /// How long to emit iteration starts. Required.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.config.duration = duration;
        self
    }

    /// Virtual users spawned before the first iteration.
    pub fn pre_allocated_vus(mut self, vus: usize) -> Self {
        self.config.pre_allocated_vus = vus;
        self
    }

    /// Hard ceiling on virtual users; beyond it, iterations are dropped and
    /// counted rather than queued.
    pub fn max_vus(mut self, vus: usize) -> Self {
        self.config.max_vus = vus;
        self
    }

    /// Fixed sleep after each iteration body before the VU goes idle.
    pub fn pacing(mut self, pacing: Duration) -> Self {
        self.config.pacing = Some(pacing);
        self
    }

    /// Bound on waiting for in-flight iterations after the schedule ends.
    pub fn graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.config.graceful_stop = graceful_stop;
        self
    }

    /// Per-request timeout for the shared HTTP client.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Base URL that relative request URLs resolve against.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    /// Declare a pass/fail threshold, e.g.
    /// `.threshold("http_req_duration", "p(95)<3")`. Parsed when the run
    /// starts; an invalid expression fails the run before any iteration.
    pub fn threshold(mut self, metric: &str, expr: &str) -> Self {
        self.config
            .thresholds
            .push((metric.to_string(), expr.to_string(), false));
        self
    }

    /// Like [`Scenario::threshold`], but also evaluated periodically during
    /// the run; a violation stops the scenario early.
    pub fn threshold_abort(mut self, metric: &str, expr: &str) -> Self {
        self.config
            .thresholds
            .push((metric.to_string(), expr.to_string(), true));
        self
    }

    /// Grace period before abort thresholds are first evaluated.
    pub fn delay_abort_eval(mut self, delay: Duration) -> Self {
        self.config.delay_abort_eval = delay;
        self
    }

    /// Trend columns shown in the run summary.
    pub fn summary_trend_stats(mut self, stats: &[TrendStat]) -> Self {
        self.config.summary_trend_stats = stats.to_vec();
        self
    }

    pub async fn run(self) -> Result<RunSummary, ScenarioError> {
        run_scenario(self.body, self.config).await
    }
}

impl<B> Future for Scenario<B>
where
    B: IterationBody + Clone,
{
    type Output = Result<RunSummary, ScenarioError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let runner = this.runner_fut.get_or_insert_with(|| {
            let body = this.body.clone();
            let config = this.config.clone();
            Box::pin(run_scenario(body, config))
        });
        runner.as_mut().poll(cx)
    }
}
