//! Module `types` implement the time-series value type and
//! primary-key validation.

use rand::Rng;

use std::fmt;

use crate::{err_at, Error, Result};

/// A fixed-length time-series, a pair of equal-length sequences
/// (times, values). Times are strictly increasing. Within one
/// database every series has the same length, fixed at creation.
#[derive(Clone, Default)]
pub struct TimeSeries {
    times: Vec<f64>,
    values: Vec<f64>,
}

impl fmt::Debug for TimeSeries {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "timeseries<len:{}>", self.times.len())
    }
}

impl PartialEq for TimeSeries {
    fn eq(&self, other: &Self) -> bool {
        self.times == other.times && self.values == other.values
    }
}

impl TimeSeries {
    /// Create a new series from its parts. Times and values must be of
    /// equal length and times must be strictly increasing.
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Result<TimeSeries> {
        if times.len() != values.len() {
            err_at!(
                InvalidArgument,
                msg: "times/values length {}/{}", times.len(), values.len()
            )?
        }
        for w in times.windows(2) {
            if !(w[0] < w[1]) {
                err_at!(InvalidArgument, msg: "times not strictly increasing")?
            }
        }
        Ok(TimeSeries { times, values })
    }

    /// Generate a random series of length `len`, times in [0.0, len)
    /// with unit stride.
    pub fn random<R: Rng>(rng: &mut R, len: usize) -> TimeSeries {
        let times: Vec<f64> = (0..len).map(|i| i as f64).collect();
        let values: Vec<f64> = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
        TimeSeries { times, values }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    #[inline]
    pub fn as_times(&self) -> &[f64] {
        &self.times
    }

    #[inline]
    pub fn as_values(&self) -> &[f64] {
        &self.values
    }

    /// Unwrap the series into its (times, values) parts.
    #[inline]
    pub fn unwrap(self) -> (Vec<f64>, Vec<f64>) {
        (self.times, self.values)
    }
}

/// Validate a primary key. Keys are opaque strings, but characters
/// reserved by the on-disk formats, and characters that cannot appear
/// in a file-name, are rejected. Allowed: ASCII alphanumerics and
/// `-`, `_`, `.`.
pub fn validate_pk(pk: &str) -> Result<()> {
    if pk.is_empty() {
        err_at!(InvalidArgument, msg: "empty primary-key")?
    }
    for ch in pk.chars() {
        match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => (),
            _ => err_at!(InvalidArgument, msg: "reserved char {:?} in pk {:?}", ch, pk)?,
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;
