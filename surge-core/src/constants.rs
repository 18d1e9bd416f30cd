use std::time::Duration;

/// Arrival window over which `rate` iterations are scheduled.
pub const DEFAULT_TIME_UNIT: Duration = Duration::from_secs(1);

/// How long to wait for in-flight iterations once the schedule ends.
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_PRE_ALLOCATED_VUS: usize = 1;

/* Built-in metric names */

pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const CHECKS: &str = "checks";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";
