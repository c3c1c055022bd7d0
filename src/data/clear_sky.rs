//! Clear-sky period detection by comparing measured and modeled irradiance.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Marks each timestamp clear (`true`) or not.
pub trait ClearSkyDetector: fmt::Debug {
    fn detect(&self, index: &[NaiveDateTime], measured: &[f64], modeled: &[f64], window_minutes: u32) -> Vec<bool>;
}

/// Reno & Hansen (2016) windowed detection.
///
/// A window of consecutive samples is clear when all five statistics of the
/// measured series are close to those of the modeled series. A timestamp is
/// clear when it lies in at least one clear window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowedClearSky {
    /// Max difference of window means, W/m^2.
    pub mean_diff: f64,
    /// Max difference of window maxima, W/m^2.
    pub max_diff: f64,
    pub lower_line_length: f64,
    pub upper_line_length: f64,
    /// Max normalized standard deviation of the measured slopes.
    pub var_diff: f64,
    /// Max difference of slopes, W/m^2 per sample.
    pub slope_dev: f64,
}

impl Default for WindowedClearSky {
    fn default() -> Self {
        WindowedClearSky {
            mean_diff: 75.0,
            max_diff: 75.0,
            lower_line_length: -5.0,
            upper_line_length: 10.0,
            var_diff: 0.005,
            slope_dev: 8.0,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn diffs(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| w[1] - w[0]).collect()
}

fn line_length(values: &[f64], dt: f64) -> f64 {
    values.windows(2).map(|w| (w[1] - w[0]).hypot(dt)).sum()
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64).sqrt()
}

impl WindowedClearSky {
    fn window_is_clear(&self, meas: &[f64], clear: &[f64], dt: f64) -> bool {
        if meas.iter().chain(clear).any(|v| !v.is_finite()) {
            return false;
        }
        let meas_mean = mean(meas);
        let line_diff = line_length(meas, dt) - line_length(clear, dt);
        let meas_slope = diffs(meas);
        let clear_slope = diffs(clear);
        let slope_nstd = if meas_mean > 0.0 {
            std_dev(&meas_slope) / meas_mean
        } else {
            f64::INFINITY
        };
        let slope_err = meas_slope
            .iter()
            .zip(&clear_slope)
            .map(|(m, c)| (m - c).abs())
            .fold(0.0, f64::max);

        (meas_mean - mean(clear)).abs() < self.mean_diff
            && (max(meas) - max(clear)).abs() < self.max_diff
            && line_diff > self.lower_line_length
            && line_diff < self.upper_line_length
            && slope_nstd < self.var_diff
            && slope_err < self.slope_dev
    }
}

/// Most frequent spacing of `index` in minutes.
fn sample_minutes(index: &[NaiveDateTime]) -> Option<f64> {
    let mut steps: Vec<i64> = index.windows(2).map(|w| (w[1] - w[0]).num_seconds()).collect();
    steps.sort_unstable();
    let mut best: Option<(i64, usize)> = None;
    for chunk in steps.chunk_by(|a, b| a == b) {
        if best.map_or(true, |(_, c)| chunk.len() > c) {
            best = Some((chunk[0], chunk.len()));
        }
    }
    best.map(|(secs, _)| secs as f64 / 60.0).filter(|m| *m > 0.0)
}

impl ClearSkyDetector for WindowedClearSky {
    fn detect(&self, index: &[NaiveDateTime], measured: &[f64], modeled: &[f64], window_minutes: u32) -> Vec<bool> {
        let n = index.len().min(measured.len()).min(modeled.len());
        let mut clear = vec![false; index.len()];
        let Some(dt) = sample_minutes(&index[..n]) else {
            return clear;
        };
        let samples = (window_minutes as f64 / dt).round() as usize;
        if samples < 3 || samples > n {
            log::debug!("Clear-sky window of {window_minutes} min holds {samples} samples, need 3 to {n}");
            return clear;
        }
        for start in 0..=n - samples {
            let end = start + samples;
            if self.window_is_clear(&measured[start..end], &modeled[start..end], dt) {
                clear[start..end].iter_mut().for_each(|c| *c = true);
            }
        }
        clear
    }
}
