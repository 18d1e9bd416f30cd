use surge_core::ConfigError;
use thiserror::Error;

/// Fatal setup errors. Nothing that happens after the first iteration is
/// scheduled ends up here; per-iteration failures are absorbed into metrics.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("invalid scenario configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
