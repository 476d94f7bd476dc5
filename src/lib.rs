pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod inactivity;
pub mod infra;
pub mod metrics;
pub mod output;
pub mod parser;
pub mod scoring;
pub mod server;
pub mod services;
pub mod state;
pub mod trigger;
