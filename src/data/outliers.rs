//! Robust covariance outlier detection for two variables.

use std::fmt;

/// Bivariate inlier/outlier classification.
pub trait OutlierDetector: fmt::Debug {
    /// Label each `(x[i], y[i])` pair `1` (inlier) or `-1` (outlier).
    ///
    /// `contamination` is the expected outlier fraction and
    /// `support_fraction` the fraction of points used for the robust
    /// location and scatter estimate. Returns `None` when no model can be
    /// fitted (too few points, or a degenerate covariance).
    fn fit_predict(&self, x: &[f64], y: &[f64], contamination: f64, support_fraction: f64) -> Option<Vec<i8>>;
}

/// Elliptic envelope around a minimum covariance determinant estimate.
///
/// The fit starts from the points closest to the coordinate-wise median and
/// refines the support set with concentration steps until it stops changing.
/// Points whose Mahalanobis distance exceeds the `1 - contamination` quantile
/// of all distances are outliers.
#[derive(Debug, Clone, Copy)]
pub struct EllipticEnvelope {
    pub max_iterations: usize,
}

impl Default for EllipticEnvelope {
    fn default() -> Self {
        EllipticEnvelope { max_iterations: 30 }
    }
}

#[derive(Debug, Clone, Copy)]
struct Gaussian2 {
    mx: f64,
    my: f64,
    sxx: f64,
    sxy: f64,
    syy: f64,
    det: f64,
}

impl Gaussian2 {
    /// Mean and covariance of the points at `subset`. `None` if singular.
    fn fit(x: &[f64], y: &[f64], subset: &[usize]) -> Option<Self> {
        let n = subset.len() as f64;
        if subset.len() < 3 {
            return None;
        }
        let mx = subset.iter().map(|&i| x[i]).sum::<f64>() / n;
        let my = subset.iter().map(|&i| y[i]).sum::<f64>() / n;
        let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
        for &i in subset {
            let (dx, dy) = (x[i] - mx, y[i] - my);
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
        }
        let (sxx, sxy, syy) = (sxx / n, sxy / n, syy / n);
        let det = sxx * syy - sxy * sxy;
        let scale = sxx.abs().max(syy.abs());
        if !(det > 1e-12 * scale * scale) {
            return None;
        }
        Some(Gaussian2 { mx, my, sxx, sxy, syy, det })
    }

    /// Squared Mahalanobis distance.
    fn distance(&self, x: f64, y: f64) -> f64 {
        let (dx, dy) = (x - self.mx, y - self.my);
        (self.syy * dx * dx - 2.0 * self.sxy * dx * dy + self.sxx * dy * dy) / self.det
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Median and median absolute deviation (1.0 when the MAD is zero).
fn median_mad(values: &[f64]) -> (f64, f64) {
    let mut v = values.to_vec();
    let med = median(&mut v);
    let mut dev: Vec<f64> = values.iter().map(|x| (x - med).abs()).collect();
    let mad = median(&mut dev);
    (med, if mad > 0.0 { mad } else { 1.0 })
}

/// Linearly interpolated percentile, `q` in `[0, 100]`.
pub(crate) fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Indices of the `h` smallest values of `score`, ascending by index.
fn smallest(score: &[f64], h: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..score.len()).collect();
    order.sort_by(|&a, &b| score[a].total_cmp(&score[b]).then(a.cmp(&b)));
    order.truncate(h);
    order.sort_unstable();
    order
}

impl OutlierDetector for EllipticEnvelope {
    fn fit_predict(&self, x: &[f64], y: &[f64], contamination: f64, support_fraction: f64) -> Option<Vec<i8>> {
        let n = x.len().min(y.len());
        if n < 3 {
            return None;
        }
        let min_support = (n + 3) / 2;
        let h = ((support_fraction * n as f64).ceil() as usize).clamp(min_support.min(n), n);

        let (medx, madx) = median_mad(&x[..n]);
        let (medy, mady) = median_mad(&y[..n]);
        let start: Vec<f64> = (0..n)
            .map(|i| ((x[i] - medx) / madx).powi(2) + ((y[i] - medy) / mady).powi(2))
            .collect();
        let mut subset = smallest(&start, h);
        let mut model = Gaussian2::fit(x, y, &subset)?;

        for _ in 0..self.max_iterations {
            let dist: Vec<f64> = (0..n).map(|i| model.distance(x[i], y[i])).collect();
            let next = smallest(&dist, h);
            if next == subset {
                break;
            }
            subset = next;
            model = Gaussian2::fit(x, y, &subset)?;
        }

        let dist: Vec<f64> = (0..n).map(|i| model.distance(x[i], y[i])).collect();
        let threshold = percentile(&dist, (1.0 - contamination) * 100.0);
        Some(dist.iter().map(|&d| if d <= threshold { 1 } else { -1 }).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_with_outlier() -> (Vec<f64>, Vec<f64>) {
        let mut x: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let mut y: Vec<f64> = (0..50).map(|i| 2.0 * i as f64 + ((i * 7 % 5) as f64 - 2.0) * 0.5).collect();
        x.push(25.0);
        y.push(-300.0);
        (x, y)
    }

    #[test]
    fn flags_the_distant_point() {
        let (x, y) = line_with_outlier();
        let labels = EllipticEnvelope::default().fit_predict(&x, &y, 0.04, 0.9).unwrap();
        assert_eq!(labels.len(), 51);
        assert_eq!(labels[50], -1);
        let outliers = labels.iter().filter(|&&l| l == -1).count();
        assert!(outliers <= 3, "{outliers} outliers");
    }

    #[test]
    fn zero_contamination_keeps_everything() {
        let (x, y) = line_with_outlier();
        let labels = EllipticEnvelope::default().fit_predict(&x, &y, 0.0, 0.9).unwrap();
        assert!(labels.iter().all(|&l| l == 1));
    }

    #[test]
    fn degenerate_input_does_not_fit() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 * v).collect();
        assert!(EllipticEnvelope::default().fit_predict(&x, &y, 0.04, 0.9).is_none());
        assert!(EllipticEnvelope::default().fit_predict(&[1.0, 2.0], &[1.0, 3.0], 0.04, 0.9).is_none());
    }

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[4.0, 1.0, 3.0, 2.0], 50.0), 2.5);
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 100.0), 3.0);
    }
}
