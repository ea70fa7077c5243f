//! Small numeric helpers shared by the stages

/// Linearly interpolated quantile of `values`, `q` in [0, 1].
///
/// Returns NaN for an empty slice.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    quantile_sorted(&sorted, q)
}

/// Same as [`quantile`] for an already ascending slice
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    interpolate_sorted(sorted, q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64)
}

/// Value at fractional index `position` of an ascending slice
pub fn interpolate_sorted(sorted: &[f64], position: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let position = position.clamp(0.0, (sorted.len() - 1) as f64);
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Min and max of the finite values, `None` if there are none
pub fn finite_range(values: impl IntoIterator<Item = f64>) -> Option<(f64, f64)> {
    values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(None, |range, v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}
