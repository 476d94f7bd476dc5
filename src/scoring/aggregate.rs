use crate::config::ParameterSpec;
use crate::error::{EngineError, Result};
use crate::scoring::grade::classify;
use crate::scoring::types::{StationScore, round_score};
use crate::scoring::utility::{normalize, weighted_geometric_aggregate};
use crate::state::StationState;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::debug;

/// Value substituted for a parameter the station did not report.
///
/// Kept at 0 for compatibility: for ranges that exclude 0 a missing
/// parameter scores 0 and drops out of the aggregate, for ranges that
/// include 0 it scores 100.
pub const ABSENT_VALUE: f64 = 0.0;

/// Scores one station's window against the configured parameter table.
///
/// Every configured parameter contributes one normalised score (absent ones
/// via [`ABSENT_VALUE`]); the composite is the weighted geometric aggregate
/// of those scores. Parameters in the window that are not configured are
/// ignored.
///
/// # Errors
///
/// Returns [`EngineError::ScoringFailure`] if any reported value is not a
/// finite number.
pub fn score_station(state: &StationState, specs: &[ParameterSpec]) -> Result<StationScore> {
    let mut scores = Vec::with_capacity(specs.len());
    let mut weights = Vec::with_capacity(specs.len());
    let mut parameter_scores = BTreeMap::new();
    let mut observed = 0;

    for spec in specs {
        let value = match state.get(&spec.name) {
            Some(v) => {
                observed += 1;
                v
            }
            None => ABSENT_VALUE,
        };

        if !value.is_finite() {
            return Err(EngineError::scoring(
                &state.station_id,
                format!("value for {} is not finite ({value})", spec.name),
            ));
        }

        let score = normalize(value, spec.low(), spec.high());
        parameter_scores.insert(spec.name.clone(), score);
        scores.push(score);
        weights.push(spec.weight);
    }

    let ignored = state.len().saturating_sub(observed);
    if ignored > 0 {
        debug!(station = %state.station_id, ignored, "Unconfigured parameters ignored");
    }

    let composite = weighted_geometric_aggregate(&scores, &weights);
    // Fractional weights leave a perfect window a few ulps below 100, so the
    // band follows the exported value.
    let band = classify(round_score(composite));

    Ok(StationScore {
        station_id: state.station_id.clone(),
        score: composite,
        band,
        parameter_scores,
        observed,
        scored_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::scoring::grade::QualityBand;
    use approx::assert_relative_eq;

    fn specs() -> Vec<ParameterSpec> {
        EngineConfig::default().parameters
    }

    fn station(values: &[(&str, f64)]) -> StationState {
        let mut s = StationState::new("BREPON");
        for (name, v) in values {
            s.parameters.insert(name.to_string(), *v);
        }
        s
    }

    #[test]
    fn test_all_in_range_is_excellent() {
        let state = station(&[
            ("oxigenio_dissolvido", 7.0),
            ("turbidez", 2.0),
            ("temperatura", 15.0),
            ("condutividade", 400.0),
            ("amonio", 0.2),
            ("ph", 7.0),
        ]);
        let result = score_station(&state, &specs()).unwrap();

        assert_relative_eq!(result.score(), 100.0, epsilon = 1e-9);
        assert_eq!(result.band(), QualityBand::Excellent);
        assert_eq!(result.observed(), 6);
    }

    #[test]
    fn test_all_failing_by_one_unit_is_good() {
        let state = station(&[
            ("oxigenio_dissolvido", 10.0),
            ("turbidez", 5.0),
            ("temperatura", 31.0),
            ("condutividade", 751.0),
            ("amonio", 1.5),
            ("ph", 10.5),
        ]);
        let result = score_station(&state, &specs()).unwrap();

        for spec in specs() {
            assert_relative_eq!(result.parameter_score(&spec.name).unwrap(), 80.0, epsilon = 1e-9);
        }
        assert_relative_eq!(result.score(), 80.0, epsilon = 1e-9);
        assert_eq!(result.band(), QualityBand::Good);
    }

    #[test]
    fn test_two_parameters_present() {
        let state = station(&[("oxigenio_dissolvido", 7.0), ("ph", 7.0)]);
        let result = score_station(&state, &specs()).unwrap();

        assert_relative_eq!(result.score(), 100.0, epsilon = 1e-9);
        assert_eq!(result.band(), QualityBand::Excellent);
        assert_eq!(result.observed(), 2);
    }

    #[test]
    fn test_absent_and_reported_zero_score_the_same() {
        // Pins the compatibility behaviour: a missing parameter is scored as
        // if it had been reported as exactly 0.
        let absent = station(&[("oxigenio_dissolvido", 7.0), ("ph", 7.8)]);
        let zeros = station(&[
            ("oxigenio_dissolvido", 7.0),
            ("ph", 7.8),
            ("condutividade", 0.0),
            ("amonio", 0.0),
            ("turbidez", 0.0),
            ("temperatura", 0.0),
        ]);

        let a = score_station(&absent, &specs()).unwrap();
        let z = score_station(&zeros, &specs()).unwrap();

        assert_eq!(a.score(), z.score());
        assert_eq!(a.parameter_scores, z.parameter_scores);
        assert_eq!(a.parameter_score("condutividade"), Some(0.0));
        // Range (0, 0.5) contains 0, so a missing amonio reading scores 100.
        assert_eq!(a.parameter_score("amonio"), Some(100.0));
    }

    #[test]
    fn test_failing_parameter_is_excluded_not_zeroed() {
        let state = station(&[("oxigenio_dissolvido", 7.0), ("ph", 20.0)]);
        let result = score_station(&state, &specs()).unwrap();

        assert_eq!(result.parameter_score("ph"), Some(0.0));
        assert_relative_eq!(result.score(), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_mixed_scores() {
        let state = station(&[
            ("oxigenio_dissolvido", 4.0), // 80
            ("ph", 7.0),                  // 100
            ("condutividade", 72.0),      // 100
        ]);
        let result = score_station(&state, &specs()).unwrap();

        // amonio, turbidez, temperatura absent but their ranges include 0.
        let expected = 80f64.powf(0.27);
        assert_relative_eq!(result.score(), expected * 100f64.powf(0.73), epsilon = 1e-9);
        assert_eq!(result.band(), QualityBand::Great);
    }

    #[test]
    fn test_band_follows_exported_score() {
        let state = station(&[("oxigenio_dissolvido", 7.0), ("ph", 7.0)]);
        let result = score_station(&state, &specs()).unwrap();

        assert!(result.score() <= 100.0);
        assert_eq!(result.rounded_score(), 100.0);
        assert_eq!(result.band(), classify(result.rounded_score()));
    }

    #[test]
    fn test_non_finite_value_is_scoring_failure() {
        let state = station(&[("ph", f64::NAN)]);
        let err = score_station(&state, &specs()).unwrap_err();
        assert!(matches!(err, EngineError::ScoringFailure { ref station, .. } if station == "BREPON"));
    }

    #[test]
    fn test_unconfigured_parameter_ignored() {
        let state = station(&[("oxigenio_dissolvido", 7.0), ("salinidade", 0.3)]);
        let result = score_station(&state, &specs()).unwrap();
        assert_eq!(result.observed(), 1);
        assert_eq!(result.parameter_score("salinidade"), None);
    }

    #[test]
    fn test_rounded_score() {
        let state = station(&[("oxigenio_dissolvido", 4.0), ("condutividade", 0.0)]);
        let mut result = score_station(&state, &specs()).unwrap();
        result.score = 93.123456;
        assert_eq!(result.rounded_score(), 93.123);
    }
}
