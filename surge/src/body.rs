use crate::executor::{HttpClient, HttpResponse};
use crate::metrics::Registry;
use std::future::Future;
use surge_core::CHECKS;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Outcome of one iteration body.
///
/// Failure is informational: request failures and check outcomes are already
/// recorded in metrics by the time the body returns, which is where the run
/// verdict comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterationResult {
    #[default]
    Completed,
    Failed,
}

impl IterationResult {
    pub fn failed(&self) -> bool {
        matches!(self, IterationResult::Failed)
    }
}

impl From<()> for IterationResult {
    fn from(_: ()) -> Self {
        IterationResult::Completed
    }
}

impl<R, E> From<Result<R, E>> for IterationResult
where
    R: Into<IterationResult>,
{
    fn from(result: Result<R, E>) -> Self {
        match result {
            Ok(inner) => inner.into(),
            Err(_) => IterationResult::Failed,
        }
    }
}

/// The user-provided workload: one scheduled iteration per call.
///
/// Implemented for any `Fn(VuContext) -> Future` closure, so a scenario is
/// usually just an async block. Return `()`, an `IterationResult`, or a
/// `Result` (whose `Err` arm maps to [`IterationResult::Failed`]).
pub trait IterationBody: Send + Sync + 'static {
    fn run_iteration(&self, ctx: VuContext) -> impl Future<Output = IterationResult> + Send;
}

impl<T, F, R> IterationBody for T
where
    T: Fn(VuContext) -> F + Send + Sync + 'static,
    F: Future<Output = R> + Send,
    R: Into<IterationResult>,
{
    fn run_iteration(&self, ctx: VuContext) -> impl Future<Output = IterationResult> + Send {
        let fut = self(ctx);
        async move { fut.await.into() }
    }
}

/// Per-iteration execution context handed to the body.
///
/// Carries the shared HTTP client and the run's metric registry; cheap to
/// clone, owned by the body for the duration of the iteration.
#[derive(Clone)]
pub struct VuContext {
    pub(crate) vu_id: usize,
    pub(crate) iteration: u64,
    pub(crate) http: HttpClient,
    pub(crate) metrics: Registry,
}

impl VuContext {
    /// Identifier of the virtual user running this iteration.
    pub fn vu_id(&self) -> usize {
        self.vu_id
    }

    /// Sequence number assigned by the arrival scheduler.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn metrics(&self) -> &Registry {
        &self.metrics
    }

    /// Run named predicates against a response, recording each outcome in
    /// the `checks` rate. Returns whether all of them passed.
    ///
    /// Predicates are plain boolean functions; anything that can go wrong
    /// inside one (e.g. parsing a malformed body) should map to `false`.
    pub fn check(
        &self,
        response: &HttpResponse,
        checks: &[(&str, &dyn Fn(&HttpResponse) -> bool)],
    ) -> bool {
        let rate = self.metrics.rate(CHECKS);
        let mut all_passed = true;
        for (name, predicate) in checks {
            let passed = predicate(response);
            rate.add(passed);
            if !passed {
                debug!("check '{name}' failed (vu={}, iter={})", self.vu_id, self.iteration);
                all_passed = false;
            }
        }
        all_passed
    }
}
