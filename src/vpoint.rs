//! Module `vpoint` implement the normalized kernelized
//! cross-correlation distance underlying vantage-point search.
//!
//! `d(a,b) = sqrt(2 * (1 - max_tau NCC(a, b, tau)))` over
//! unit-normalized series; identical series are at distance ZERO,
//! the maximum distance is 2. Distances to each vantage point are
//! cached in ordered-indexed metadata fields and candidate sets are
//! pruned with the triangle inequality.

use crate::{err_at, sax, Error, Result, TimeSeries};

/// Cross-correlation distance between two series; times are ignored,
/// the value sequences must be of equal length.
pub fn distance(a: &TimeSeries, b: &TimeSeries) -> Result<f64> {
    distance_values(a.as_values(), b.as_values())
}

/// See [distance].
pub fn distance_values(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.is_empty() || (a.len() != b.len()) {
        err_at!(InvalidArgument, msg: "series lengths {}/{}", a.len(), b.len())?
    }
    let (ua, ub) = (unit_norm(a), unit_norm(b));
    let m = max_ncc(&ua, &ub);
    Ok((2.0 * (1.0 - m)).max(0.0).sqrt())
}

// best circular cross-correlation over all shifts, O(n^2); series
// lengths here are modest.
fn max_ncc(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len();
    let mut best = f64::NEG_INFINITY;
    for tau in 0..n {
        let mut acc = 0.0;
        for i in 0..n {
            acc += a[i] * b[(i + tau) % n];
        }
        if acc > best {
            best = acc;
        }
    }
    best
}

/// z-normalize `values` and scale to unit l2-norm, under which NCC
/// of identical series is ONE.
pub fn unit_norm(values: &[f64]) -> Vec<f64> {
    let scale = (values.len() as f64).sqrt();
    sax::zscore(values)
        .into_iter()
        .map(|v| v / scale)
        .collect()
}

/// Euclidean distance between the z-normalized series, the exact
/// refinement used over iSAX terminal candidates.
pub fn znorm_euclidean(a: &[f64], b: &[f64]) -> f64 {
    let (za, zb) = (sax::zscore(a), sax::zscore(b));
    za.iter()
        .zip(zb.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
#[path = "vpoint_test.rs"]
mod vpoint_test;
