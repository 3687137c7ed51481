pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod signaling;
pub mod throughput;
pub mod transaction;
