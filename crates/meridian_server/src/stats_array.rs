//! An ordered sequence of samples with a cached {mean, stddev, min, max}
//! summary, exposed to scripts as `tile38.new_stats_array()`.
//!
//! The summary is computed lazily with Welford's algorithm (population
//! standard deviation) and dropped whenever the sequence is mutated.

/// erf has no std implementation; this is the Abramowitz–Stegun 7.1.26
/// rational approximation, max absolute error 1.5e-7.
pub fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

/// Normal CDF: `0.5·(1+erf((x−μ)/(σ·√2)))`, and 0 when `σ ≤ 0`.
pub fn cdf(x: f64, mean: f64, stddev: f64) -> f64 {
    if stddev <= 0.0 {
        return 0.0;
    }
    0.5 * (1.0 + erf((x - mean) / (stddev * std::f64::consts::SQRT_2)))
}

/// CDF with a floor: probability mass between `xmin` and `x`, clamped to
/// non-negative.
pub fn cdf_with_floor(x: f64, xmin: f64, mean: f64, stddev: f64) -> f64 {
    if stddev <= 0.0 {
        return 0.0;
    }
    (cdf(x, mean, stddev) - cdf(xmin, mean, stddev)).max(0.0)
}

#[derive(Debug, Clone, Copy)]
struct Summary {
    mean: f64,
    stddev: f64,
    min: f64,
    max: f64,
}

#[derive(Debug, Clone, Default)]
pub struct StatsArray {
    xs: Vec<f64>,
    summary: Option<Summary>,
}

impl StatsArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.xs.get(index).copied()
    }

    pub fn append(&mut self, x: f64) {
        self.summary = None;
        self.xs.push(x);
    }

    pub fn mean(&mut self) -> f64 {
        self.summarize().mean
    }

    pub fn stddev(&mut self) -> f64 {
        self.summarize().stddev
    }

    pub fn min(&mut self) -> f64 {
        self.summarize().min
    }

    pub fn max(&mut self) -> f64 {
        self.summarize().max
    }

    fn summarize(&mut self) -> Summary {
        if let Some(summary) = self.summary {
            return summary;
        }
        let mut s = Summary {
            mean: 0.0,
            stddev: 0.0,
            min: 0.0,
            max: 0.0,
        };
        if !self.xs.is_empty() {
            let mut m2 = 0.0;
            let mut min = self.xs[0];
            let mut max = self.xs[0];
            for (i, &x) in self.xs.iter().enumerate() {
                let n = (i + 1) as f64;
                let delta = x - s.mean;
                s.mean += delta / n;
                let delta2 = x - s.mean;
                m2 += delta * delta2;
                if x < min {
                    min = x;
                } else if x > max {
                    max = x;
                }
            }
            s.stddev = (m2 / self.xs.len() as f64).sqrt();
            s.min = min;
            s.max = max;
        }
        self.summary = Some(s);
        s
    }

    /// Replace every element by its CDF value under the sequence's own
    /// normal fit.
    pub fn cdf_in_place(&mut self) {
        let Summary { mean, stddev, .. } = self.summarize();
        self.summary = None;
        for x in &mut self.xs {
            *x = cdf(*x, mean, stddev);
        }
    }

    /// CDF of a single value under the sequence's normal fit.
    pub fn cdf_of(&mut self, x: f64) -> f64 {
        let Summary { mean, stddev, .. } = self.summarize();
        cdf(x, mean, stddev)
    }

    /// Indexes of the `n` smallest values, smallest first.
    pub fn min_indexes(&self, n: usize) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.xs.len()).collect();
        idx.sort_by(|&a, &b| {
            self.xs[a]
                .partial_cmp(&self.xs[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        idx.truncate(n.min(self.xs.len()));
        idx
    }

    /// Indexes of the `n` largest values, largest first.
    pub fn max_indexes(&self, n: usize) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.xs.len()).collect();
        idx.sort_by(|&a, &b| {
            self.xs[b]
                .partial_cmp(&self.xs[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        idx.truncate(n.min(self.xs.len()));
        idx
    }

    pub fn clamp(&mut self, min: f64, max: f64) {
        self.summary = None;
        for x in &mut self.xs {
            *x = x.clamp(min, max);
        }
    }

    pub fn apply_scalar(&mut self, b: f64, f: impl Fn(f64, f64) -> f64) {
        self.summary = None;
        for x in &mut self.xs {
            *x = f(*x, b);
        }
    }

    /// Element-wise combine, truncating to the shorter of the two
    /// sequences.
    pub fn apply_array(&mut self, b: &StatsArray, f: impl Fn(f64, f64) -> f64) {
        self.summary = None;
        let n = self.xs.len().min(b.xs.len());
        for i in 0..n {
            self.xs[i] = f(self.xs[i], b.xs[i]);
        }
        self.xs.truncate(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(values: &[f64]) -> StatsArray {
        let mut a = StatsArray::new();
        for &v in values {
            a.append(v);
        }
        a
    }

    #[test]
    fn test_summary_mean_stddev_min_max() {
        let mut a = filled(&[99.0, 88.0, 77.0]);
        assert!((a.mean() - 88.0).abs() < 1e-9);
        let expected_stddev = (242.0f64 / 3.0).sqrt();
        assert!((a.stddev() - expected_stddev).abs() < 1e-9);
        assert_eq!(a.min(), 77.0);
        assert_eq!(a.max(), 99.0);
    }

    #[test]
    fn test_summary_invalidated_on_append() {
        let mut a = filled(&[1.0, 2.0, 3.0]);
        assert!((a.mean() - 2.0).abs() < 1e-9);
        a.append(10.0);
        assert!((a.mean() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_cdf_matches_scenario_values() {
        // {100, 110, 200, 210}: cdf(min)*100 ≈ 13, cdf(200)*100 ≈ 81.
        let mut a = filled(&[100.0, 110.0, 200.0, 210.0]);
        let min = a.min();
        assert_eq!((a.cdf_of(min) * 100.0).floor(), 13.0);
        assert_eq!((a.cdf_of(200.0) * 100.0).floor(), 81.0);
    }

    #[test]
    fn test_cdf_zero_when_stddev_zero() {
        let mut a = filled(&[5.0, 5.0, 5.0]);
        assert_eq!(a.cdf_of(5.0), 0.0);
        assert_eq!(cdf(1.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_cdf_with_floor() {
        // cdf(90, 10, 99, 8)*100 ≈ 13.
        assert_eq!((cdf_with_floor(90.0, 10.0, 99.0, 8.0) * 100.0).floor(), 13.0);
        assert_eq!(cdf_with_floor(1.0, 0.0, 5.0, 0.0), 0.0);
        // Floor clamps to non-negative.
        assert_eq!(cdf_with_floor(10.0, 90.0, 99.0, 8.0), 0.0);
    }

    #[test]
    fn test_erf_reference_points() {
        assert!((erf(0.0)).abs() < 1e-9);
        assert!((erf(1.0) - 0.8427007929).abs() < 1e-6);
        assert!((erf(-1.0) + 0.8427007929).abs() < 1e-6);
        assert!((erf(3.0) - 0.9999779095).abs() < 1e-6);
    }

    #[test]
    fn test_cdf_in_place_replaces_elements() {
        let mut a = filled(&[100.0, 110.0, 200.0, 210.0]);
        a.cdf_in_place();
        for i in 0..a.len() {
            let v = a.get(i).unwrap();
            assert!((0.0..=1.0).contains(&v));
        }
        // Values are monotone in the originals.
        assert!(a.get(0).unwrap() < a.get(3).unwrap());
    }

    #[test]
    fn test_min_max_indexes() {
        let a = filled(&[5.0, 1.0, 9.0, 3.0]);
        assert_eq!(a.min_indexes(2), vec![1, 3]);
        assert_eq!(a.max_indexes(2), vec![2, 0]);
        assert_eq!(a.min_indexes(10).len(), 4);
    }

    #[test]
    fn test_clamp_and_arithmetic() {
        let mut a = filled(&[1.0, 5.0, 9.0]);
        a.clamp(2.0, 8.0);
        assert_eq!(a.get(0), Some(2.0));
        assert_eq!(a.get(2), Some(8.0));

        let b = filled(&[1.0, 1.0]);
        a.apply_array(&b, |x, y| x + y);
        // Truncated to the shorter length.
        assert_eq!(a.len(), 2);
        assert_eq!(a.get(0), Some(3.0));

        a.apply_scalar(2.0, |x, y| x * y);
        assert_eq!(a.get(0), Some(6.0));
    }
}
