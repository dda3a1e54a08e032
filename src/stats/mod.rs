//! Statistics and rate-distortion curve comparison.
//!
//! ## Core Statistics
//!
//! - [`Summary`]: Descriptive statistics (mean, median, population std_dev, range)
//! - [`median`], [`mean`], [`pstdev`]: Basic statistical functions
//! - [`pearson`]: Pearson correlation of paired samples
//!
//! ## Rate-Distortion Analysis
//!
//! - [`bd::bd_rate`] / [`bd::bd_psnr`]: Bjontegaard Delta metrics
//! - [`bd::compare_rd`]: Status-producing comparison with degraded-data fallbacks

pub mod bd;

pub use bd::{BdOutcome, BdStatus, RdPoint, RdSet, bd_psnr, bd_rate, compare_rd};

use serde::{Deserialize, Serialize};

/// Descriptive statistics for a set of measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Number of values.
    pub count: usize,
    /// Mean value.
    pub mean: f64,
    /// Median value.
    pub median: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    /// Minimum value.
    pub min: f64,
    /// Maximum value.
    pub max: f64,
}

impl Summary {
    /// Compute summary statistics for a slice of values.
    ///
    /// Returns `None` if the slice is empty.
    #[must_use]
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        Some(Self {
            count: sorted.len(),
            mean: mean(&sorted),
            median: median_sorted(&sorted),
            std_dev: pstdev(&sorted),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        })
    }
}

//=============================================================================
// Core Statistical Functions
//=============================================================================

/// Compute median of a slice.
///
/// For even-length slices, returns the average of the two middle values.
///
/// # Example
///
/// ```
/// use codec_ablate::stats::median;
///
/// assert_eq!(median(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3.0);
/// assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
/// ```
#[must_use]
pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    median_sorted(&sorted)
}

fn median_sorted(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Compute arithmetic mean.
///
/// # Example
///
/// ```
/// use codec_ablate::stats::mean;
///
/// assert!((mean(&[2.0, -0.5, 3.0]) - 1.5).abs() < 1e-12);
/// ```
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Compute population standard deviation (N denominator).
///
/// # Example
///
/// ```
/// use codec_ablate::stats::pstdev;
///
/// let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
/// assert!((pstdev(&values) - 2.0).abs() < 1e-12);
/// ```
#[must_use]
pub fn pstdev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Pearson correlation coefficient of paired samples.
///
/// Returns `None` for mismatched lengths, fewer than two pairs, or when
/// either side has zero variance (the coefficient is undefined).
///
/// # Example
///
/// ```
/// use codec_ablate::stats::pearson;
///
/// let r = pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap();
/// assert!((r - 1.0).abs() < 1e-12);
/// assert!(pearson(&[1.0, 1.0, 1.0], &[2.0, 4.0, 6.0]).is_none());
/// ```
#[must_use]
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x);
    let my = mean(y);
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= f64::EPSILON || syy <= f64::EPSILON {
        return None;
    }
    Some((sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0))
}
