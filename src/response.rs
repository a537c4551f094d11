//! Dose-response curves used by behavior rules. All map into `[0, 1]`.

/// 0 at or below `s_min`, 1 at or above `s_max`, linear in between.
pub fn linear_response_function(s: f64, s_min: f64, s_max: f64) -> f64 {
    if s <= s_min {
        return 0.0;
    }
    if s >= s_max {
        return 1.0;
    }
    (s - s_min) / (s_max - s_min)
}

/// 1 at or below `s_min`, 0 at or above `s_max`, linear in between.
pub fn decreasing_linear_response_function(s: f64, s_min: f64, s_max: f64) -> f64 {
    1.0 - linear_response_function(s, s_min, s_max)
}

/// `s^n / (h^n + s^n)`. Exactly 0 for `s <= 0` and exactly 0.5 at `s == h`.
pub fn hill_response_function(s: f64, half_max: f64, hill_power: f64) -> f64 {
    if s <= 0.0 {
        return 0.0;
    }
    // (s/h)^n / (1 + (s/h)^n) keeps s == h exact
    let ratio = (s / half_max).powf(hill_power);
    ratio / (1.0 + ratio)
}

/// Combined Hill activation `U / (1 + U)` with `U = sum (s_i / h_i)^n`.
pub fn multivariate_hill(signals: &[f64], half_maxes: &[f64], hill_power: f64) -> f64 {
    let total: f64 = signals
        .iter()
        .zip(half_maxes)
        .filter(|(s, _)| **s > 0.0)
        .map(|(s, h)| (s / h).powf(hill_power))
        .sum();
    total / (1.0 + total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hill_is_zero_at_zero_and_half_at_half_max() {
        assert_eq!(hill_response_function(0.0, 0.2, 2.0), 0.0);
        assert_eq!(hill_response_function(-1.0, 0.2, 2.0), 0.0);
        assert_eq!(hill_response_function(0.2, 0.2, 2.0), 0.5);
        assert_eq!(hill_response_function(7.5, 7.5, 3.7), 0.5);
    }

    #[test]
    fn hill_is_monotone() {
        let mut previous = 0.0;
        for i in 1..200 {
            let value = hill_response_function(i as f64 * 0.01, 0.5, 4.0);
            assert!(value > previous);
            assert!(value < 1.0);
            previous = value;
        }
    }

    #[test]
    fn decreasing_linear_ramps_down() {
        assert_eq!(decreasing_linear_response_function(1.0, 5.0, 38.0), 1.0);
        assert_eq!(decreasing_linear_response_function(5.0, 5.0, 38.0), 1.0);
        assert_eq!(decreasing_linear_response_function(38.0, 5.0, 38.0), 0.0);
        assert_eq!(decreasing_linear_response_function(100.0, 5.0, 38.0), 0.0);
        let mid = decreasing_linear_response_function(21.5, 5.0, 38.0);
        assert!((mid - 0.5).abs() < 1e-12);
    }

    #[test]
    fn linear_is_clamped() {
        assert_eq!(linear_response_function(-3.0, 0.0, 1.0), 0.0);
        assert_eq!(linear_response_function(3.0, 0.0, 1.0), 1.0);
        assert!((linear_response_function(0.25, 0.0, 1.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn multivariate_hill_reduces_to_single_signal() {
        let single = hill_response_function(0.3, 0.6, 2.0);
        let multi = multivariate_hill(&[0.3, 0.0], &[0.6, 1.0], 2.0);
        assert!((single - multi).abs() < 1e-12);
        assert_eq!(multivariate_hill(&[0.0, 0.0], &[1.0, 1.0], 2.0), 0.0);
    }
}
