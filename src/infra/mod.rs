pub mod hydrology;
pub mod mqtt;
pub mod prometheus;
