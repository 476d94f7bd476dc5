//! Water-quality scoring.
//!
//! Each configured parameter is normalised against its acceptable range,
//! the normalised scores are combined with a weighted geometric aggregate,
//! and the composite is classified into a [`grade::QualityBand`].

pub mod aggregate;
pub mod grade;
pub mod types;
pub mod utility;

pub use aggregate::score_station;
pub use grade::{QualityBand, classify};
pub use types::{ScoreRecord, StationScore};
pub use utility::{normalize, weighted_geometric_aggregate};
