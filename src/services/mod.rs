pub mod publisher;
pub mod reading_source;
pub mod timeseries;

pub use publisher::MessagePublisher;
pub use reading_source::ReadingSource;
pub use timeseries::{MemorySeries, Sample, TimeSeriesQuery};
