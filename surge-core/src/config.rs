use crate::constants::{
    DEFAULT_GRACEFUL_STOP, DEFAULT_PRE_ALLOCATED_VUS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_TIME_UNIT,
};
use crate::stats::{TrendStat, DEFAULT_TREND_STATS};
use crate::threshold::{ParseThresholdError, Threshold};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

/// Scenario configuration. Immutable once the run starts.
///
/// Thresholds are carried as raw expressions and compiled by
/// [`ScenarioConfig::compiled_thresholds`]; [`ScenarioConfig::validate`] is
/// the single place configuration errors become fatal, before any iteration
/// is scheduled.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub name: String,
    /// Iteration starts per `time_unit`.
    pub rate: NonZeroU32,
    pub time_unit: Duration,
    pub duration: Duration,
    pub pre_allocated_vus: usize,
    pub max_vus: usize,
    /// Fixed sleep after each iteration body, before the VU goes idle.
    pub pacing: Option<Duration>,
    pub graceful_stop: Duration,
    pub request_timeout: Duration,
    /// Resolved against relative request URLs.
    pub base_url: Option<String>,
    /// `(metric, expression, abort_on_fail)` as declared.
    pub thresholds: Vec<(String, String, bool)>,
    /// Grace period before abort-on-fail thresholds are first evaluated.
    pub delay_abort_eval: Duration,
    pub summary_trend_stats: Vec<TrendStat>,
}

impl ScenarioConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rate: NonZeroU32::MIN,
            time_unit: DEFAULT_TIME_UNIT,
            duration: Duration::ZERO,
            pre_allocated_vus: DEFAULT_PRE_ALLOCATED_VUS,
            max_vus: 0,
            pacing: None,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            base_url: None,
            thresholds: Vec::new(),
            delay_abort_eval: Duration::ZERO,
            summary_trend_stats: DEFAULT_TREND_STATS.to_vec(),
        }
    }

    /// Interval between consecutive iteration starts.
    pub fn arrival_period(&self) -> Duration {
        self.time_unit / self.rate.get()
    }

    /// Hard ceiling on concurrent virtual users.
    pub fn max_vus(&self) -> usize {
        self.max_vus.max(self.pre_allocated_vus)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.time_unit.is_zero() {
            return Err(ConfigError::ZeroTimeUnit);
        }
        if self.pre_allocated_vus == 0 {
            return Err(ConfigError::ZeroPreAllocatedVus);
        }
        if self.max_vus != 0 && self.max_vus < self.pre_allocated_vus {
            return Err(ConfigError::PoolBounds {
                pre_allocated_vus: self.pre_allocated_vus,
                max_vus: self.max_vus,
            });
        }
        self.compiled_thresholds()?;
        Ok(())
    }

    pub fn compiled_thresholds(&self) -> Result<Vec<Threshold>, ConfigError> {
        self.thresholds
            .iter()
            .map(|(metric, expr, abort_on_fail)| {
                let expr = expr.parse().map_err(|source| ConfigError::Threshold {
                    metric: metric.clone(),
                    expr: expr.clone(),
                    source,
                })?;
                let mut threshold = Threshold::new(metric.clone(), expr);
                threshold.abort_on_fail = *abort_on_fail;
                Ok(threshold)
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("scenario duration must be non-zero")]
    ZeroDuration,

    #[error("arrival-rate time unit must be non-zero")]
    ZeroTimeUnit,

    #[error("at least one pre-allocated virtual user is required")]
    ZeroPreAllocatedVus,

    #[error("max_vus ({max_vus}) must be at least pre_allocated_vus ({pre_allocated_vus})")]
    PoolBounds {
        pre_allocated_vus: usize,
        max_vus: usize,
    },

    #[error("invalid threshold '{expr}' on metric '{metric}': {source}")]
    Threshold {
        metric: String,
        expr: String,
        source: ParseThresholdError,
    },
}
