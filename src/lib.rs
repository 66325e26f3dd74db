pub mod analyzer;
pub mod analyzers;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metadata;
pub mod pipeline;
pub mod processor;
pub mod rate_limiter;
pub mod store;
pub mod stores;
pub mod walker;
pub mod web_server;
