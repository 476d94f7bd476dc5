/// Points lost per unit of distance outside the acceptable range.
pub const DECAY_PER_UNIT: f64 = 20.0;

/// Maps a raw value onto 0–100 against its acceptable range `[low, high]`.
///
/// Inside the range (inclusive) the score is 100; outside it drops by
/// [`DECAY_PER_UNIT`] per unit of distance, floored at 0.
pub fn normalize(value: f64, low: f64, high: f64) -> f64 {
    let distance = if value < low {
        low - value
    } else if value > high {
        value - high
    } else {
        return 100.0;
    };
    (100.0 - distance * DECAY_PER_UNIT).max(0.0)
}

/// Weighted geometric mean of `scores`, ignoring every pair whose score is
/// `<= 0` and renormalising the remaining weights to sum to 1.
///
/// `weights[i]` belongs to `scores[i]`; extra entries on either side are
/// ignored. Returns `1.0` when nothing survives the filter.
pub fn weighted_geometric_aggregate(scores: &[f64], weights: &[f64]) -> f64 {
    let valid: Vec<(f64, f64)> = scores
        .iter()
        .zip(weights)
        .filter(|(score, _)| **score > 0.0)
        .map(|(s, w)| (*s, *w))
        .collect();

    let weight_sum: f64 = valid.iter().map(|(_, w)| w).sum();
    if valid.is_empty() || weight_sum <= 0.0 {
        return 1.0;
    }

    valid
        .iter()
        .map(|(score, weight)| score.powf(weight / weight_sum))
        .product()
}
