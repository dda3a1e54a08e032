//! Bjontegaard Delta (BD-Rate / BD-PSNR) computation.
//!
//! Each curve with three or more points is fitted with a least-squares
//! cubic. With exactly three points the cubic is underdetermined and the
//! minimum-norm solution on column-scaled powers is used, which is what
//! `numpy.polyfit(x, y, 3)` returns. Two points give a log-linear line. The
//! fitted curves are integrated analytically over the overlap of their
//! domains and the averages compared.
//!
//! BD-Rate fits `ln(bitrate) = f(PSNR)` and reports the average rate change
//! in percent (negative = test is cheaper at equal quality). BD-PSNR fits
//! `PSNR = g(ln(bitrate))` and reports the average quality change in dB.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Highest polynomial degree used for fitting.
pub const MAX_DEGREE: usize = 3;

/// Pivots smaller than this make the normal equations singular.
const PIVOT_EPSILON: f64 = 1e-12;

/// One rate-distortion point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RdPoint {
    /// Bitrate in kbps.
    pub bitrate_kbps: f64,
    /// Luma PSNR in dB.
    pub psnr_y: f64,
}

impl RdPoint {
    /// Create a point.
    #[must_use]
    pub fn new(bitrate_kbps: f64, psnr_y: f64) -> Self {
        Self {
            bitrate_kbps,
            psnr_y,
        }
    }
}

/// Rate-distortion points of one configuration, keyed by QP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RdSet {
    points: BTreeMap<i32, RdPoint>,
}

impl RdSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the point for a QP, replacing any earlier one.
    pub fn insert(&mut self, qp: i32, point: RdPoint) {
        self.points.insert(qp, point);
    }

    /// Point at a QP.
    #[must_use]
    pub fn get(&self, qp: i32) -> Option<&RdPoint> {
        self.points.get(&qp)
    }

    /// Number of QPs with a point.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the set holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// QPs present in both sets, ascending.
    #[must_use]
    pub fn common_qps(&self, other: &RdSet) -> Vec<i32> {
        self.points
            .keys()
            .filter(|qp| other.points.contains_key(qp))
            .copied()
            .collect()
    }

    /// Points at the given QPs, skipping absent ones.
    #[must_use]
    pub fn points_at(&self, qps: &[i32]) -> Vec<RdPoint> {
        qps.iter().filter_map(|qp| self.points.get(qp).copied()).collect()
    }
}

impl FromIterator<(i32, RdPoint)> for RdSet {
    fn from_iter<I: IntoIterator<Item = (i32, RdPoint)>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

/// Polynomial in centred form: `sum(coeffs[k] * (x - center)^k)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    /// Expansion point.
    pub center: f64,
    /// Coefficients, lowest order first.
    pub coeffs: Vec<f64>,
}

impl Polynomial {
    /// Evaluate at `x`.
    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        let u = x - self.center;
        self.coeffs.iter().rev().fold(0.0, |acc, c| acc * u + c)
    }

    /// Definite integral over `[a, b]`.
    #[must_use]
    pub fn integral(&self, a: f64, b: f64) -> f64 {
        let antiderivative = |x: f64| {
            let u = x - self.center;
            self.coeffs
                .iter()
                .enumerate()
                .rev()
                .fold(0.0, |acc, (k, c)| acc * u + c / (k + 1) as f64)
                * u
        };
        antiderivative(b) - antiderivative(a)
    }
}

/// Least-squares polynomial fit of `y = p(x)`.
///
/// Solves the normal equations on mean-centred `x` by Gaussian elimination
/// with partial pivoting.
///
/// # Errors
///
/// [`Error::InsufficientPoints`] when there are fewer than `degree + 1`
/// points or the abscissae are too degenerate to determine the curve.
///
/// # Example
///
/// ```
/// use codec_ablate::stats::bd::polyfit;
///
/// let x = [0.0, 1.0, 2.0, 3.0];
/// let y: Vec<f64> = x.iter().map(|v| 1.0 + 2.0 * v - v * v).collect();
/// let p = polyfit(&x, &y, 2).unwrap();
/// assert!((p.eval(4.0) - (1.0 + 8.0 - 16.0)).abs() < 1e-9);
/// ```
pub fn polyfit(x: &[f64], y: &[f64], degree: usize) -> Result<Polynomial> {
    let n = x.len().min(y.len());
    let size = degree + 1;
    if n < size {
        return Err(Error::InsufficientPoints {
            have: n,
            need: size,
        });
    }

    let center = x[..n].iter().sum::<f64>() / n as f64;
    let mut a = vec![vec![0.0; size]; size];
    let mut b = vec![0.0; size];
    for (xi, yi) in x[..n].iter().zip(&y[..n]) {
        let u = xi - center;
        let mut powers = vec![1.0; 2 * size - 1];
        for k in 1..powers.len() {
            powers[k] = powers[k - 1] * u;
        }
        for i in 0..size {
            for j in 0..size {
                a[i][j] += powers[i + j];
            }
            b[i] += powers[i] * yi;
        }
    }

    let coeffs = solve_linear(a, b).ok_or_else(|| Error::InsufficientPoints {
        have: distinct_count(&x[..n]),
        need: size,
    })?;
    Ok(Polynomial { center, coeffs })
}

/// Minimum-norm polynomial fit for fewer points than coefficients.
///
/// Each power column is scaled to unit length, the minimum-norm solution
/// `c = A^T (A A^T)^-1 y` is taken and the scaling undone. This reproduces
/// `numpy.polyfit` when `degree + 1` exceeds the point count; with enough
/// points use [`polyfit`].
///
/// # Errors
///
/// [`Error::InsufficientPoints`] when two abscissae coincide.
///
/// # Example
///
/// ```
/// use codec_ablate::stats::bd::polyfit_min_norm;
///
/// let x = [36.0, 38.0, 40.0];
/// let y = [6.9, 7.6, 8.3];
/// let p = polyfit_min_norm(&x, &y, 3).unwrap();
/// for (xi, yi) in x.iter().zip(&y) {
///     assert!((p.eval(*xi) - yi).abs() < 1e-6);
/// }
/// ```
pub fn polyfit_min_norm(x: &[f64], y: &[f64], degree: usize) -> Result<Polynomial> {
    let n = x.len().min(y.len());
    let size = degree + 1;
    let degenerate = || Error::InsufficientPoints {
        have: distinct_count(&x[..n]),
        need: n,
    };
    if n == 0 {
        return Err(degenerate());
    }

    let rows: Vec<Vec<f64>> = x[..n]
        .iter()
        .map(|xi| {
            let mut powers = vec![1.0; size];
            for k in 1..size {
                powers[k] = powers[k - 1] * xi;
            }
            powers
        })
        .collect();
    let scale: Vec<f64> = (0..size)
        .map(|k| rows.iter().map(|r| r[k] * r[k]).sum::<f64>().sqrt())
        .collect();
    if scale.iter().any(|s| *s <= 0.0) {
        return Err(degenerate());
    }
    let scaled: Vec<Vec<f64>> = rows
        .iter()
        .map(|r| r.iter().zip(&scale).map(|(v, s)| v / s).collect())
        .collect();

    let gram: Vec<Vec<f64>> = scaled
        .iter()
        .map(|ri| {
            scaled
                .iter()
                .map(|rj| ri.iter().zip(rj).map(|(a, b)| a * b).sum())
                .collect()
        })
        .collect();
    let weights = solve_linear(gram, y[..n].to_vec()).ok_or_else(degenerate)?;

    let coeffs = (0..size)
        .map(|k| {
            scaled
                .iter()
                .zip(&weights)
                .map(|(row, w)| row[k] * w)
                .sum::<f64>()
                / scale[k]
        })
        .collect();
    Ok(Polynomial {
        center: 0.0,
        coeffs,
    })
}

/// Gaussian elimination with partial pivoting. `None` when singular.
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let size = b.len();
    for col in 0..size {
        let pivot = (col..size)
            .max_by(|&r, &s| a[r][col].abs().total_cmp(&a[s][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..size {
            let factor = a[row][col] / a[col][col];
            for k in col..size {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut solution = vec![0.0; size];
    for row in (0..size).rev() {
        let tail: f64 = (row + 1..size).map(|k| a[row][k] * solution[k]).sum();
        solution[row] = (b[row] - tail) / a[row][row];
    }
    Some(solution)
}

fn distinct_count(values: &[f64]) -> usize {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    sorted.len()
}

fn check_points(points: &[RdPoint]) -> Result<()> {
    let usable = points
        .iter()
        .filter(|p| p.bitrate_kbps > 0.0 && p.bitrate_kbps.is_finite() && p.psnr_y.is_finite())
        .count();
    if usable < 2 || usable < points.len() {
        return Err(Error::InsufficientPoints {
            have: usable,
            need: points.len().max(2),
        });
    }
    Ok(())
}

/// Cubic for three or more points, a line for two.
fn fit_curve(x: &[f64], y: &[f64]) -> Result<Polynomial> {
    match x.len() {
        n if n > MAX_DEGREE => polyfit(x, y, MAX_DEGREE),
        n if n >= 3 => polyfit_min_norm(x, y, MAX_DEGREE),
        _ => polyfit(x, y, 1),
    }
}

fn overlap(a: &[f64], b: &[f64]) -> Result<(f64, f64)> {
    let min = |v: &[f64]| v.iter().copied().fold(f64::INFINITY, f64::min);
    let max = |v: &[f64]| v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let low = min(a).max(min(b));
    let high = max(a).min(max(b));
    if high <= low {
        return Err(Error::NoOverlap { low, high });
    }
    Ok((low, high))
}

/// Average of the fitted `y = p(x)` curves of both sets over their common `x` range.
fn average_gap(ax: &[f64], ay: &[f64], tx: &[f64], ty: &[f64]) -> Result<f64> {
    let (low, high) = overlap(ax, tx)?;
    let anchor = fit_curve(ax, ay)?;
    let test = fit_curve(tx, ty)?;
    let width = high - low;
    Ok((test.integral(low, high) - anchor.integral(low, high)) / width)
}

/// BD-Rate of `test` against `anchor`, in percent.
///
/// # Errors
///
/// [`Error::InsufficientPoints`] with fewer than two points per curve or a
/// non-positive bitrate; [`Error::NoOverlap`] when the PSNR ranges are disjoint.
///
/// # Example
///
/// ```
/// use codec_ablate::stats::{RdPoint, bd_rate};
///
/// let anchor = [
///     RdPoint::new(500.0, 33.0),
///     RdPoint::new(800.0, 34.5),
///     RdPoint::new(1300.0, 36.0),
///     RdPoint::new(2100.0, 37.2),
/// ];
/// let cheaper: Vec<RdPoint> = anchor
///     .iter()
///     .map(|p| RdPoint::new(p.bitrate_kbps * 0.9, p.psnr_y))
///     .collect();
/// let bd = bd_rate(&anchor, &cheaper).unwrap();
/// assert!((bd + 10.0).abs() < 1e-6);
/// ```
pub fn bd_rate(anchor: &[RdPoint], test: &[RdPoint]) -> Result<f64> {
    check_points(anchor)?;
    check_points(test)?;

    let psnr = |pts: &[RdPoint]| pts.iter().map(|p| p.psnr_y).collect::<Vec<_>>();
    let log_rate = |pts: &[RdPoint]| pts.iter().map(|p| p.bitrate_kbps.ln()).collect::<Vec<_>>();

    let gap = average_gap(&psnr(anchor), &log_rate(anchor), &psnr(test), &log_rate(test))?;
    Ok((gap.exp() - 1.0) * 100.0)
}

/// BD-PSNR of `test` against `anchor`, in dB.
///
/// # Errors
///
/// As for [`bd_rate`], with the overlap taken over log-bitrate.
pub fn bd_psnr(anchor: &[RdPoint], test: &[RdPoint]) -> Result<f64> {
    check_points(anchor)?;
    check_points(test)?;

    let psnr = |pts: &[RdPoint]| pts.iter().map(|p| p.psnr_y).collect::<Vec<_>>();
    let log_rate = |pts: &[RdPoint]| pts.iter().map(|p| p.bitrate_kbps.ln()).collect::<Vec<_>>();

    average_gap(&log_rate(anchor), &psnr(anchor), &log_rate(test), &psnr(test))
}

/// Outcome status of a BD comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BdStatus {
    /// Three or more common QPs; exact result.
    Ok,
    /// Exactly two common QPs; log-linear estimate.
    OkEst2Qp,
    /// This many more common QPs are required.
    NeedQp(usize),
    /// No anchor data for the sequence.
    NoAnchor,
    /// Jobs exist but none produced a usable point yet.
    Pending,
    /// Fitting failed; holds the error kind.
    Error(String),
}

impl BdStatus {
    /// Whether a numeric result accompanies this status.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Ok | Self::OkEst2Qp)
    }

    /// Whether the numeric result is an approximation.
    #[must_use]
    pub fn is_estimate(&self) -> bool {
        matches!(self, Self::OkEst2Qp)
    }
}

impl fmt::Display for BdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::OkEst2Qp => f.write_str("OK_EST2QP"),
            Self::NeedQp(n) => write!(f, "NEED_{n}_QP"),
            Self::NoAnchor => f.write_str("NO_ANCHOR"),
            Self::Pending => f.write_str("PENDING"),
            Self::Error(kind) => write!(f, "BDERR:{kind}"),
        }
    }
}

impl FromStr for BdStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let status = match s.trim() {
            "OK" => Self::Ok,
            "OK_EST2QP" => Self::OkEst2Qp,
            "NO_ANCHOR" => Self::NoAnchor,
            "PENDING" => Self::Pending,
            other => {
                if let Some(kind) = other.strip_prefix("BDERR:") {
                    Self::Error(kind.to_string())
                } else if let Some(n) = other
                    .strip_prefix("NEED_")
                    .and_then(|rest| rest.strip_suffix("_QP"))
                    .and_then(|n| n.parse().ok())
                {
                    Self::NeedQp(n)
                } else {
                    return Err(Error::Config(format!("unknown BD status {other:?}")));
                }
            }
        };
        Ok(status)
    }
}

impl Serialize for BdStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BdStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Result of comparing two RD sets.
#[derive(Debug, Clone, PartialEq)]
pub struct BdOutcome {
    /// BD-Rate in percent, when computable.
    pub bd_rate_percent: Option<f64>,
    /// BD-PSNR in dB, when computable.
    pub bd_psnr_db: Option<f64>,
    /// QPs the numeric result is based on.
    pub qps_used: Vec<i32>,
    /// Outcome status.
    pub status: BdStatus,
}

/// Compare a test RD set against an anchor over their common QPs.
///
/// Three or more common QPs give `OK`; exactly two give `OK_EST2QP` when
/// `allow_two_qp` is set; otherwise the status is `NEED_{3-n}_QP`. Fitting
/// errors become `BDERR:<kind>`. Nothing here aborts a batch.
#[must_use]
pub fn compare_rd(anchor: &RdSet, test: &RdSet, allow_two_qp: bool) -> BdOutcome {
    let common = anchor.common_qps(test);
    let unresolved = |status| BdOutcome {
        bd_rate_percent: None,
        bd_psnr_db: None,
        qps_used: Vec::new(),
        status,
    };

    let status = match common.len() {
        n if n >= 3 => BdStatus::Ok,
        2 if allow_two_qp => BdStatus::OkEst2Qp,
        n => return unresolved(BdStatus::NeedQp(3 - n)),
    };

    let anchor_points = anchor.points_at(&common);
    let test_points = test.points_at(&common);
    match bd_rate(&anchor_points, &test_points) {
        Ok(rate) => BdOutcome {
            bd_rate_percent: Some(rate),
            bd_psnr_db: bd_psnr(&anchor_points, &test_points).ok(),
            qps_used: common,
            status,
        },
        Err(e) => unresolved(BdStatus::Error(e.kind().to_string())),
    }
}
