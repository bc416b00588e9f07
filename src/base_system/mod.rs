pub mod config;
pub mod context;
pub mod cooldown_retry;
pub mod logging;
