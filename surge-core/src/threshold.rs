//! Pass/fail expressions over aggregate metrics, in the `p(95)<3` /
//! `rate<0.01` form.

use crate::data::MetricValue;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// A declared threshold: metric name plus the expression evaluated against it.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expr: ThresholdExpr,
    /// Evaluate periodically during the run and stop early on violation.
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn new(metric: impl Into<String>, expr: ThresholdExpr) -> Self {
        Self {
            metric: metric.into(),
            expr,
            abort_on_fail: false,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.expr)
    }
}

/// Aggregate selector, comparison operator and literal bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub agg: Aggregate,
    pub op: CmpOp,
    pub bound: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    /// `p(95)` etc., stored as a 0..1 quantile.
    Percentile(f64),
    Avg,
    Min,
    Med,
    Max,
    Rate,
    Count,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            CmpOp::Lt => observed < bound,
            CmpOp::Le => observed <= bound,
            CmpOp::Gt => observed > bound,
            CmpOp::Ge => observed >= bound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
    /// No data recorded for the metric; no data, no violation.
    Vacuous,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        !matches!(self, Verdict::Failed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub observed: Option<f64>,
}

impl ThresholdExpr {
    /// Evaluate against the metric's snapshot value, if any.
    ///
    /// A metric that was never recorded, a rate with a zero denominator, or
    /// an empty trend all evaluate vacuously true. An aggregate that does
    /// not apply to the metric's kind fails the threshold: passing silently
    /// would hide a misconfigured expression.
    pub fn evaluate(&self, metric: &str, value: Option<&MetricValue>) -> Evaluation {
        let Some(value) = value else {
            return Evaluation {
                verdict: Verdict::Vacuous,
                observed: None,
            };
        };

        let observed = match (self.agg, value) {
            (Aggregate::Count, MetricValue::Counter(count)) => Some(*count as f64),
            (Aggregate::Value, MetricValue::Counter(count)) => Some(*count as f64),
            (Aggregate::Rate, MetricValue::Rate { total: 0, .. }) => None,
            (Aggregate::Rate, MetricValue::Rate { trues, total }) => {
                Some(*trues as f64 / *total as f64)
            }
            (Aggregate::Value, MetricValue::Gauge(value)) => Some(*value),
            (_, MetricValue::Trend(trend)) if trend.count() == 0 => None,
            (Aggregate::Percentile(quantile), MetricValue::Trend(trend)) => {
                Some(trend.quantile(quantile))
            }
            (Aggregate::Avg, MetricValue::Trend(trend)) => Some(trend.avg()),
            (Aggregate::Min, MetricValue::Trend(trend)) => Some(trend.min()),
            (Aggregate::Med, MetricValue::Trend(trend)) => Some(trend.quantile(0.5)),
            (Aggregate::Max, MetricValue::Trend(trend)) => Some(trend.max()),
            (Aggregate::Count, MetricValue::Trend(trend)) => Some(trend.count() as f64),
            (agg, value) => {
                warn!(
                    "threshold aggregate {agg:?} does not apply to {} metric '{metric}'",
                    value.kind()
                );
                return Evaluation {
                    verdict: Verdict::Failed,
                    observed: None,
                };
            }
        };

        match observed {
            None => Evaluation {
                verdict: Verdict::Vacuous,
                observed: None,
            },
            Some(observed) => Evaluation {
                verdict: if self.op.holds(observed, self.bound) {
                    Verdict::Passed
                } else {
                    Verdict::Failed
                },
                observed: Some(observed),
            },
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseThresholdError {
    #[error("empty threshold expression")]
    Empty,

    #[error("unknown aggregate '{0}'")]
    UnknownAggregate(String),

    #[error("quantile must be between 0 and 100, got {0}")]
    InvalidQuantile(f64),

    #[error("expected a comparison operator in '{0}'")]
    MissingComparison(String),

    #[error("invalid bound '{0}'")]
    InvalidBound(String),
}

impl FromStr for ThresholdExpr {
    type Err = ParseThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseThresholdError::Empty);
        }

        let op_at = s
            .find(['<', '>'])
            .ok_or_else(|| ParseThresholdError::MissingComparison(s.to_string()))?;

        let (agg_str, rest) = s.split_at(op_at);
        let (op, bound_str) = if let Some(bound) = rest.strip_prefix("<=") {
            (CmpOp::Le, bound)
        } else if let Some(bound) = rest.strip_prefix(">=") {
            (CmpOp::Ge, bound)
        } else if let Some(bound) = rest.strip_prefix('<') {
            (CmpOp::Lt, bound)
        } else {
            (CmpOp::Gt, &rest[1..])
        };

        let agg = parse_aggregate(agg_str.trim())?;
        let bound_str = bound_str.trim();
        let bound: f64 = bound_str
            .parse()
            .map_err(|_| ParseThresholdError::InvalidBound(bound_str.to_string()))?;

        Ok(Self { agg, op, bound })
    }
}

fn parse_aggregate(s: &str) -> Result<Aggregate, ParseThresholdError> {
    match s {
        "avg" => Ok(Aggregate::Avg),
        "min" => Ok(Aggregate::Min),
        "med" => Ok(Aggregate::Med),
        "max" => Ok(Aggregate::Max),
        "rate" => Ok(Aggregate::Rate),
        "count" => Ok(Aggregate::Count),
        "value" => Ok(Aggregate::Value),
        _ => {
            let inner = s
                .strip_prefix("p(")
                .and_then(|rest| rest.strip_suffix(')'))
                .ok_or_else(|| ParseThresholdError::UnknownAggregate(s.to_string()))?;

            let percent: f64 = inner
                .trim()
                .parse()
                .map_err(|_| ParseThresholdError::UnknownAggregate(s.to_string()))?;

            if percent <= 0. || percent >= 100. {
                return Err(ParseThresholdError::InvalidQuantile(percent));
            }

            Ok(Aggregate::Percentile(percent / 100.))
        }
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.agg, self.op, self.bound)
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregate::Percentile(quantile) => write!(f, "p({})", quantile * 100.),
            Aggregate::Avg => write!(f, "avg"),
            Aggregate::Min => write!(f, "min"),
            Aggregate::Med => write!(f, "med"),
            Aggregate::Max => write!(f, "max"),
            Aggregate::Rate => write!(f, "rate"),
            Aggregate::Count => write!(f, "count"),
            Aggregate::Value => write!(f, "value"),
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{op}")
    }
}
