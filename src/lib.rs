// Core modules
pub mod aggregator;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod exchange;
pub mod feed;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod reconcile;

// Re-export commonly used types
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
