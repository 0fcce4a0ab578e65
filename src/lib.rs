pub mod config;
pub mod constants;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod rate_limiter;
pub mod template;
pub mod types;

// Release check and notification pipeline
pub mod pipeline;

// Layered boundaries: use cases and ports, then adapters
pub mod app;
pub mod infra;
