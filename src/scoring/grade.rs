use serde::Serialize;
use std::fmt;

/// Qualitative band of a composite water-quality score.
///
/// Variants are ordered worst to best; the discriminant is the ordinal
/// exported as the band gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum QualityBand {
    Terrible = 1,
    Bad = 2,
    Fair = 3,
    Good = 4,
    Great = 5,
    Excellent = 6,
}

impl QualityBand {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityBand::Terrible => "terrible",
            QualityBand::Bad => "bad",
            QualityBand::Fair => "fair",
            QualityBand::Good => "good",
            QualityBand::Great => "great",
            QualityBand::Excellent => "excellent",
        }
    }
}

impl fmt::Display for QualityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a composite score into a [`QualityBand`].
///
/// Bands are half-open, upper bound exclusive:
///
/// | Range       | Band      |
/// |-------------|-----------|
/// | >= 100      | Excellent |
/// | [91, 100)   | Great     |
/// | [71, 91)    | Good      |
/// | [51, 71)    | Fair      |
/// | [26, 51)    | Bad       |
/// | < 26        | Terrible  |
pub fn classify(score: f64) -> QualityBand {
    match score {
        s if s >= 100.0 => QualityBand::Excellent,
        s if s >= 91.0 => QualityBand::Great,
        s if s >= 71.0 => QualityBand::Good,
        s if s >= 51.0 => QualityBand::Fair,
        s if s >= 26.0 => QualityBand::Bad,
        _ => QualityBand::Terrible,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(classify(0.0), QualityBand::Terrible);
        assert_eq!(classify(25.999), QualityBand::Terrible);
        assert_eq!(classify(26.0), QualityBand::Bad);
        assert_eq!(classify(50.999), QualityBand::Bad);
        assert_eq!(classify(51.0), QualityBand::Fair);
        assert_eq!(classify(70.999), QualityBand::Fair);
        assert_eq!(classify(71.0), QualityBand::Good);
        assert_eq!(classify(90.999), QualityBand::Good);
        assert_eq!(classify(91.0), QualityBand::Great);
        assert_eq!(classify(99.999), QualityBand::Great);
        assert_eq!(classify(100.0), QualityBand::Excellent);
        assert_eq!(classify(100.001), QualityBand::Excellent);
    }

    #[test]
    fn test_band_ordinals_and_order() {
        assert_eq!(QualityBand::Terrible.ordinal(), 1);
        assert_eq!(QualityBand::Excellent.ordinal(), 6);
        assert!(QualityBand::Good < QualityBand::Great);
        assert_eq!(QualityBand::Fair.to_string(), "fair");
    }
}
