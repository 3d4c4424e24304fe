// Error taxonomy and classification
pub mod error;

// Provider and engine configuration
pub mod config;

// Encrypted token vault
pub mod vault;

// OAuth 2.0 authorization code flow
pub mod oauth;

// Access-token lifecycle and refresh
pub mod token_manager;

// Per-provider request rate limiting
pub mod rate_limit;

// Exponential-backoff retry
pub mod retry;

// Provider API client pipeline
pub mod client;

// Idempotency ledger checks
pub mod idempotency;

// Conflict detection and resolution
pub mod conflict;

// Sync audit log
pub mod sync_log;

// Data store boundary and SQLite implementation
pub mod store;

// Sync orchestration
pub mod orchestrator;
