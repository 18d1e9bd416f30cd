#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod executor;
pub mod metrics;
pub mod scenario;

mod body;
mod error;
pub(crate) mod pool;
pub(crate) mod runner;
pub(crate) mod scheduler;

pub use body::{IterationBody, IterationResult, VuContext};
pub use error::ScenarioError;
pub use scenario::Scenario;

pub use surge_core as core;

pub mod prelude {
    pub use crate::executor::{HttpClient, HttpResponse, Method};
    pub use crate::{IterationBody, IterationResult, Scenario, ScenarioError, VuContext};
    pub use surge_core::{RunSummary, TrendStat};
}
