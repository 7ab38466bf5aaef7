//! Core functionality for the relay.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling and logging
//! - Metrics collection
//! - HTTP middleware, rate limiting and header policy
//! - Persistence and token estimation

pub mod cancel;
pub mod config;
pub mod database;
pub mod error;
pub mod error_types;
pub mod header_policy;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod tokenizer;

// Re-export commonly used types
pub use cancel::StreamCancelHandle;
pub use config::AppConfig;
pub use database::{Database, DatabaseConfig, PgStore};
pub use error::{AppError, Result};
pub use logging::{get_request_id, init_tracing, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, MetricsMiddleware};
pub use rate_limiter::RateLimiter;
pub use tokenizer::{TiktokenEstimator, TokenEstimator};
