pub mod breaker;
pub mod config;
pub mod guardian;
pub mod limiter;
pub mod models;
pub mod prompts;
pub mod providers;
pub mod repos;
pub mod telemetry;
pub mod tier;
