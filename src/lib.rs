pub mod aggregate;
pub mod cache;
pub mod config;
pub mod constants;
pub mod dedupe;
pub mod input;
pub mod logging;
pub mod output;
pub mod pipeline;
pub mod rate_limit;
pub mod services;
pub mod shutdown;
pub mod similarity;
pub mod state;
pub mod task;
pub mod workers;
