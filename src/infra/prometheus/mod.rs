pub mod client;

pub use client::PrometheusQueryClient;
