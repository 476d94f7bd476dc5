pub mod client;

pub use client::HydrologyClient;
