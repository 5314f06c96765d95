//! Energy-curve resampling, normalization and shape classification.
//!
//! Every curve that gets compared is first brought to [`CURVE_RESOLUTION`]
//! samples and min-max scaled into [0, 1]; shape descriptors are derived from
//! that normalized form.

use serde::{Deserialize, Serialize};

/// Fixed number of samples every normalized curve carries.
pub const CURVE_RESOLUTION: usize = 100;

/// Below this value range a curve is left unscaled (near-silent material).
const MIN_NORMALIZE_RANGE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveTrend {
    Rising,
    Falling,
    Flat,
    Peaked,
    Valley,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CurvePattern {
    Steady,
    Building,
    Dropping,
    Dynamic,
    DoubleClimb,
}

/// Derived shape descriptor of a normalized energy curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyCurveShape {
    /// Position of the maximum as a fraction of the curve (0-1).
    pub peak_position: f64,
    pub peak_value: f64,
    pub mean: f64,
    pub variance: f64,
    pub trend: CurveTrend,
    pub pattern: CurvePattern,
}

/// Nearest-sample resample to `len` points. Empty input yields zeros.
pub fn resample(curve: &[f64], len: usize) -> Vec<f64> {
    if curve.is_empty() || len == 0 {
        return vec![0.0; len];
    }
    if len == 1 {
        return vec![curve[0]];
    }
    let last = (curve.len() - 1) as f64;
    (0..len)
        .map(|i| {
            let pos = i as f64 * last / (len - 1) as f64;
            curve[(pos.round() as usize).min(curve.len() - 1)]
        })
        .collect()
}

/// Resample to [`CURVE_RESOLUTION`] and min-max scale into [0, 1].
///
/// Curves whose value range is at most 0.01 are not stretched; they are only
/// clamped into [0, 1]. Non-finite samples map to 0.
pub fn normalize(curve: &[f64]) -> Vec<f64> {
    let resampled = resample(curve, CURVE_RESOLUTION);
    let (min, max) = min_max(&resampled);
    let range = max - min;
    if range <= MIN_NORMALIZE_RANGE {
        return resampled
            .into_iter()
            .map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 })
            .collect();
    }
    resampled
        .into_iter()
        .map(|v| {
            if v.is_finite() {
                ((v - min) / range).clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect()
}

/// Compute the shape descriptor of an already-normalized curve.
pub fn analyze_shape(curve: &[f64]) -> EnergyCurveShape {
    let n = curve.len();
    if n == 0 {
        return EnergyCurveShape {
            peak_position: 0.0,
            peak_value: 0.0,
            mean: 0.0,
            variance: 0.0,
            trend: CurveTrend::Flat,
            pattern: CurvePattern::Steady,
        };
    }

    let (peak_index, peak_value) = curve
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::MIN), |best, (i, v)| if v > best.1 { (i, v) } else { best });
    let peak_position = if n > 1 {
        peak_index as f64 / (n - 1) as f64
    } else {
        0.0
    };
    let mean = mean(curve);
    let variance = variance(curve, mean);
    let trend = classify_trend(curve, peak_position, peak_value, mean);
    let pattern = classify_pattern(curve, trend, mean, variance);

    EnergyCurveShape {
        peak_position,
        peak_value,
        mean,
        variance,
        trend,
        pattern,
    }
}

/// Trend from first/last quartile means, with the peak and valley checks.
fn classify_trend(curve: &[f64], peak_position: f64, peak_value: f64, mean_value: f64) -> CurveTrend {
    let n = curve.len();
    let q = (n / 4).max(1);
    let first = mean(&curve[..q]);
    let last = mean(&curve[n - q..]);
    let diff = last - first;

    if diff.abs() < 0.1 {
        let peak_in_middle = peak_position > 1.0 / 3.0 && peak_position < 2.0 / 3.0;
        if peak_in_middle && peak_value > mean_value + 0.2 {
            return CurveTrend::Peaked;
        }
        return CurveTrend::Flat;
    }
    if diff > 0.2 {
        return CurveTrend::Rising;
    }
    if diff < -0.2 {
        return CurveTrend::Falling;
    }

    let middle = mean(&curve[n / 3..(2 * n / 3).max(n / 3 + 1).min(n)]);
    if middle < first && middle < last {
        CurveTrend::Valley
    } else {
        CurveTrend::Flat
    }
}

fn classify_pattern(curve: &[f64], trend: CurveTrend, mean_value: f64, variance: f64) -> CurvePattern {
    if variance < 0.01 {
        return CurvePattern::Steady;
    }
    if count_climaxes(curve, mean_value) >= 2 {
        return CurvePattern::DoubleClimb;
    }
    match trend {
        CurveTrend::Rising => CurvePattern::Building,
        CurveTrend::Falling => CurvePattern::Dropping,
        _ if variance > 0.05 => CurvePattern::Dynamic,
        _ => CurvePattern::Steady,
    }
}

/// Count separated local maxima that stand clearly above the curve mean.
fn count_climaxes(curve: &[f64], mean_value: f64) -> usize {
    let min_gap = (curve.len() / 10).max(1);
    let threshold = mean_value + 0.15;
    let mut count = 0;
    let mut last_peak: Option<usize> = None;
    let mut dipped = true;

    for i in 0..curve.len() {
        let v = curve[i];
        if v < mean_value {
            dipped = true;
        }
        let left = if i > 0 { curve[i - 1] } else { f64::MIN };
        let right = if i + 1 < curve.len() { curve[i + 1] } else { f64::MIN };
        if v >= threshold && v >= left && v > right {
            let far_enough = last_peak.is_none_or(|p| i - p >= min_gap);
            if far_enough && dipped {
                count += 1;
                last_peak = Some(i);
                dipped = false;
            }
        }
    }
    count
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub fn variance(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Pearson correlation over the common prefix. Zero variance yields 0.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let ma = mean(a);
    let mb = mean(b);
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    let denom = (va * vb).sqrt();
    if denom < 1e-12 { 0.0 } else { (cov / denom).clamp(-1.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, from: f64, to: f64) -> Vec<f64> {
        (0..n)
            .map(|i| from + (to - from) * i as f64 / (n - 1) as f64)
            .collect()
    }

    #[test]
    fn test_normalize_always_100_in_unit_range() {
        for input in [
            vec![],
            vec![5.0],
            vec![3.0; 7],
            ramp(17, -4.0, 9.0),
            ramp(1000, 0.2, 0.8),
            vec![0.0, 100.0, 0.0, 50.0],
        ] {
            let c = normalize(&input);
            assert_eq!(c.len(), CURVE_RESOLUTION);
            assert!(c.iter().all(|v| (0.0..=1.0).contains(v)), "{input:?}");
        }
    }

    #[test]
    fn test_normalize_maps_non_finite_samples_to_zero() {
        for input in [
            vec![0.0, f64::NAN, 1.0],
            vec![f64::NEG_INFINITY, 2.0, 4.0, f64::INFINITY],
            vec![f64::NAN; 5],
        ] {
            let c = normalize(&input);
            assert_eq!(c.len(), CURVE_RESOLUTION);
            assert!(
                c.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v)),
                "{input:?}"
            );
        }

        // Finite samples still span the full range around a NaN.
        let c = normalize(&[0.0, f64::NAN, 1.0]);
        assert_eq!(c[0], 0.0);
        assert_eq!(c[CURVE_RESOLUTION - 1], 1.0);
    }

    #[test]
    fn test_normalize_stretches_to_full_range() {
        let c = normalize(&ramp(50, 0.2, 0.6));
        assert!((c[0] - 0.0).abs() < 1e-9);
        assert!((c[99] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_near_silent_curve_is_not_amplified() {
        let c = normalize(&[0.001, 0.002, 0.003]);
        assert!(c.iter().all(|&v| v < 0.01));
    }

    #[test]
    fn test_resample_keeps_endpoints() {
        let r = resample(&[1.0, 2.0, 3.0], 5);
        assert_eq!(r.len(), 5);
        assert_eq!(r[0], 1.0);
        assert_eq!(r[4], 3.0);
    }

    #[test]
    fn test_trend_rising_and_falling() {
        let up = analyze_shape(&normalize(&ramp(100, 0.0, 1.0)));
        assert_eq!(up.trend, CurveTrend::Rising);
        assert_eq!(up.pattern, CurvePattern::Building);

        let down = analyze_shape(&normalize(&ramp(100, 1.0, 0.0)));
        assert_eq!(down.trend, CurveTrend::Falling);
        assert_eq!(down.pattern, CurvePattern::Dropping);
    }

    #[test]
    fn test_trend_peaked() {
        let mut c = ramp(50, 0.0, 1.0);
        c.extend(ramp(50, 1.0, 0.0));
        let shape = analyze_shape(&normalize(&c));
        assert_eq!(shape.trend, CurveTrend::Peaked);
        assert!((shape.peak_position - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_trend_flat() {
        let shape = analyze_shape(&normalize(&vec![0.5; 100]));
        assert_eq!(shape.trend, CurveTrend::Flat);
        assert_eq!(shape.pattern, CurvePattern::Steady);
        assert_eq!(shape.variance, 0.0);
    }

    #[test]
    fn test_trend_valley() {
        // Ends differ by ~0.15 so neither the flat nor rising rule applies.
        let mut c = ramp(50, 0.85, 0.0);
        c.extend(ramp(50, 0.0, 1.0));
        let shape = analyze_shape(&c);
        assert_eq!(shape.trend, CurveTrend::Valley);
    }

    #[test]
    fn test_double_climb() {
        let mut c = Vec::new();
        c.extend(ramp(25, 0.0, 1.0));
        c.extend(ramp(25, 1.0, 0.0));
        c.extend(ramp(25, 0.0, 1.0));
        c.extend(ramp(25, 1.0, 0.0));
        let shape = analyze_shape(&normalize(&c));
        assert_eq!(shape.pattern, CurvePattern::DoubleClimb);
    }

    #[test]
    fn test_pearson() {
        let a = ramp(10, 0.0, 1.0);
        let b = ramp(10, 1.0, 0.0);
        assert!((pearson(&a, &a) - 1.0).abs() < 1e-9);
        assert!((pearson(&a, &b) + 1.0).abs() < 1e-9);
        assert_eq!(pearson(&a, &[0.5; 10]), 0.0);
        assert_eq!(pearson(&[], &[]), 0.0);
    }
}
