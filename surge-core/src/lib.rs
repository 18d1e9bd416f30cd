mod config;
mod constants;
mod data;
mod stats;
mod threshold;

pub use config::*;
pub use constants::*;
pub use data::*;
pub use stats::*;
pub use threshold::*;
