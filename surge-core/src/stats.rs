use crate::constants::{DROPPED_ITERATIONS, ITERATIONS};
use crate::data::{MetricSnapshot, MetricValue};
use crate::threshold::{Threshold, Verdict};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Trend columns rendered in the run summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrendStat {
    Avg,
    Min,
    Med,
    Max,
    /// `p(90)` etc., stored as a 0..1 quantile.
    Percentile(f64),
}

impl TrendStat {
    pub fn value(&self, trend: &crate::data::TrendStats) -> f64 {
        match self {
            TrendStat::Avg => trend.avg(),
            TrendStat::Min => trend.min(),
            TrendStat::Med => trend.quantile(0.5),
            TrendStat::Max => trend.max(),
            TrendStat::Percentile(quantile) => trend.quantile(*quantile),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown trend stat '{0}'")]
pub struct ParseTrendStatError(String);

impl FromStr for TrendStat {
    type Err = ParseTrendStatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "avg" => Ok(TrendStat::Avg),
            "min" => Ok(TrendStat::Min),
            "med" => Ok(TrendStat::Med),
            "max" => Ok(TrendStat::Max),
            other => {
                let percent = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|inner| inner.trim().parse::<f64>().ok())
                    .filter(|p| *p > 0. && *p < 100.)
                    .ok_or_else(|| ParseTrendStatError(other.to_string()))?;
                Ok(TrendStat::Percentile(percent / 100.))
            }
        }
    }
}

impl fmt::Display for TrendStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendStat::Avg => write!(f, "avg"),
            TrendStat::Min => write!(f, "min"),
            TrendStat::Med => write!(f, "med"),
            TrendStat::Max => write!(f, "max"),
            TrendStat::Percentile(quantile) => write!(f, "p({})", quantile * 100.),
        }
    }
}

pub const DEFAULT_TREND_STATS: &[TrendStat] = &[
    TrendStat::Avg,
    TrendStat::Min,
    TrendStat::Med,
    TrendStat::Max,
    TrendStat::Percentile(0.90),
    TrendStat::Percentile(0.95),
];

/// Outcome of one declared threshold.
#[derive(Debug, Clone)]
pub struct ThresholdVerdict {
    pub threshold: Threshold,
    pub verdict: Verdict,
    pub observed: Option<f64>,
}

impl ThresholdVerdict {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

/// Final report for a scenario run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub scenario: String,
    pub elapsed: Duration,
    /// Virtual users spawned over the lifetime of the run.
    pub vus_spawned: usize,
    pub snapshot: MetricSnapshot,
    pub verdicts: Vec<ThresholdVerdict>,
    pub trend_stats: Vec<TrendStat>,
}

impl RunSummary {
    pub fn iterations(&self) -> u64 {
        self.snapshot.counter(ITERATIONS)
    }

    pub fn dropped_iterations(&self) -> u64 {
        self.snapshot.counter(DROPPED_ITERATIONS)
    }

    /// Overall verdict: the AND of every declared threshold.
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(ThresholdVerdict::passed)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "scenario {} ({} elapsed, {} VUs spawned)",
            self.scenario,
            humantime::format_duration(round_ms(self.elapsed)),
            self.vus_spawned,
        )?;

        let names = self.snapshot.sorted_names();
        let width = names.iter().map(|n| n.len()).max().unwrap_or(0) + 3;

        for name in names {
            let Some(value) = self.snapshot.get(name) else {
                continue;
            };
            write!(f, "  {name:.<width$}: ")?;
            match value {
                MetricValue::Counter(count) => {
                    let rate = *count as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON);
                    writeln!(f, "{count} ({rate:.2}/s)")?;
                }
                MetricValue::Rate { trues, total } => {
                    let rate = if *total == 0 {
                        0.
                    } else {
                        *trues as f64 / *total as f64
                    };
                    writeln!(f, "{:.2}% ({trues}/{total})", rate * 100.)?;
                }
                MetricValue::Gauge(value) => writeln!(f, "{value}")?,
                MetricValue::Trend(trend) => {
                    for (i, stat) in self.trend_stats.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        write!(f, "{stat}={:.2}ms", stat.value(trend))?;
                    }
                    writeln!(f)?;
                    for (tags, stats) in trend.sorted_tags() {
                        writeln!(
                            f,
                            "    {tags}: count={} avg={:.2}ms max={:.2}ms",
                            stats.count(),
                            stats.avg(),
                            stats.max(),
                        )?;
                    }
                }
            }
        }

        for verdict in &self.verdicts {
            let mark = if verdict.passed() { '✓' } else { '✗' };
            write!(f, "{mark} {}", verdict.threshold)?;
            match (verdict.verdict, verdict.observed) {
                (Verdict::Vacuous, _) => writeln!(f, " (no data)")?,
                (_, Some(observed)) => writeln!(f, " (observed {observed:.4})")?,
                (_, None) => writeln!(f)?,
            }
        }

        Ok(())
    }
}

// humantime prints full nanosecond precision; a tenth of a second is plenty
// for a report header.
fn round_ms(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64 / 100 * 100)
}
