//! Relay services: channel selection, dispatch, transport and billing.
//!
//! Storage is reached only through the collaborator traits in [`catalog`].

pub mod catalog;
pub mod channel_selector;
pub mod dispatcher;
pub mod memory_store;
pub mod quota_reconciler;
pub mod transport;
pub mod usage_extractor;

// Re-export commonly used types
pub use catalog::{ChannelCatalog, ChannelHealthReporter, ChannelQuery, QuotaLedger, TokenStore};
pub use channel_selector::{ChannelSelector, RandomSource, SeededRandom, ThreadRandom};
pub use dispatcher::RelayDispatcher;
pub use memory_store::MemoryStore;
pub use quota_reconciler::QuotaReconciler;
pub use transport::PassthroughTransport;
