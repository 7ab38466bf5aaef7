//! Passthrough Relay - a billing-aware relay for a chat-stream upstream API
//!
//! The relay accepts a chat-stream envelope from a caller token, picks a
//! backend channel by priority and weight, forwards the body untouched
//! (streaming or buffered) and settles the caller's quota from the usage the
//! upstream reports, or from a local estimate when it reports none.
//!
//! - **Channel selection**: priority tiers with weighted random choice and
//!   escalation to lower tiers on retry
//! - **Passthrough transport**: raw byte relay with idle timeouts, re-chunking
//!   and client disconnect detection
//! - **Quota reconciliation**: pre-consumption, delta settlement and refunds
//! - **Usage API**: token balance and the upstream model catalogue
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! - [`core`]: Config, errors, logging, metrics, middleware, persistence
//! - [`api`]: HTTP handlers, authentication and domain types
//! - [`services`]: Selection, dispatch, transport and billing
//!
//! # Configuration
//!
//! Required environment variables:
//! - `DB_URL`: PostgreSQL database connection URL
//!
//! Optional:
//! - `RELAY_CONFIG`: path to a YAML/TOML/JSON settings file
//! - `RELAY_*`: settings overrides, e.g. `RELAY_SERVER__PORT=18000`
//! - `RUST_LOG`, `LOG_FORMAT=json`, `NO_COLOR`: logging
//! - `TOKIO_WORKER_THREADS`: runtime size (defaults to the cgroup CPU limit)

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState, Backends};
pub use core::{AppConfig, AppError, Database, DatabaseConfig, PgStore, Result};
pub use services::{MemoryStore, RelayDispatcher};
