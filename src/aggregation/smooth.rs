//! Divisor smoothing.

/// Rounds `value` to the nearest multiple of `divisor`, merging nearby
/// points onto one grid cell. Ties round away from zero (the behavior of
/// [`f32::round`]), so results are consistent across runs. A divisor of
/// zero or less leaves the value untouched.
pub fn smooth(value: f32, divisor: f32) -> f32 {
    if divisor <= 0.0 {
        return value;
    }
    (value / divisor).round() * divisor
}
