//! Module `sax` implement symbolic-aggregate-approximation, the
//! dimensionality reduction feeding the iSAX tree.
//!
//! A series of length `L` is z-normalized, reduced to `w` segment
//! means (piecewise aggregate approximation), and each mean is
//! quantized into one of `c` equiprobable bands of the standard
//! normal distribution. The output word has `w` symbols drawn from
//! an alphabet of cardinality `c`.

use lazy_static::lazy_static;

use std::collections::BTreeMap;

use crate::{err_at, Error, Result};

/// Standard deviations below this are treated as zero while
/// z-normalizing; the series is then encoded as all-zeros.
pub const STD_EPSILON: f64 = 1e-10;

lazy_static! {
    // cardinality -> the c-1 breakpoints partitioning the standard
    // normal into c equiprobable bands.
    static ref BREAKPOINTS: BTreeMap<usize, Vec<f64>> = {
        let mut table = BTreeMap::new();
        for c in [2_usize, 4, 8, 16, 32, 64, 128, 256].iter() {
            table.insert(*c, gaussian_breakpoints(*c));
        }
        table
    };
}

/// SAX encoder for fixed parameters `w` (word length) and `c`
/// (alphabet cardinality, a power of two).
pub struct Sax {
    word_len: usize,
    cardinality: usize,
    breakpoints: Vec<f64>,
}

impl Sax {
    pub fn new(word_len: usize, cardinality: usize) -> Result<Sax> {
        if word_len == 0 {
            err_at!(InvalidArgument, msg: "word length must be positive")?
        }
        let breakpoints = match BREAKPOINTS.get(&cardinality) {
            Some(bps) => bps.clone(),
            None => err_at!(InvalidArgument, msg: "cardinality {}", cardinality)?,
        };
        Ok(Sax {
            word_len,
            cardinality,
            breakpoints,
        })
    }

    #[inline]
    pub fn to_word_len(&self) -> usize {
        self.word_len
    }

    #[inline]
    pub fn to_cardinality(&self) -> usize {
        self.cardinality
    }

    /// Encode `values` into a SAX word of `word_len` symbols, each in
    /// `[0, cardinality)`.
    pub fn encode(&self, values: &[f64]) -> Result<Vec<u8>> {
        if values.is_empty() || (values.len() % self.word_len) != 0 {
            err_at!(
                InvalidArgument,
                msg: "series length {} for word length {}", values.len(), self.word_len
            )?
        }

        let zs = zscore(values);
        let seg = values.len() / self.word_len;

        let word = zs
            .chunks(seg)
            .map(|chunk| {
                let paa = chunk.iter().sum::<f64>() / (seg as f64);
                self.quantize(paa)
            })
            .collect();
        Ok(word)
    }

    // band index of `value`, values on a breakpoint fall in the
    // lower band.
    fn quantize(&self, value: f64) -> u8 {
        self.breakpoints.iter().take_while(|bp| value > **bp).count() as u8
    }

    /// Distance between two symbols in breakpoint space, used to
    /// pick the nearest child while descending the iSAX tree past a
    /// missing symbol.
    pub fn symbol_distance(&self, a: u8, b: u8) -> f64 {
        (self.anchor(a) - self.anchor(b)).abs()
    }

    // representative point of a band: the midpoint of its two
    // breakpoints, or the outermost breakpoint for the open bands.
    fn anchor(&self, sym: u8) -> f64 {
        let (sym, last) = (sym as usize, self.cardinality - 1);
        match sym {
            0 => self.breakpoints[0],
            s if s == last => self.breakpoints[last - 1],
            s => (self.breakpoints[s - 1] + self.breakpoints[s]) / 2.0,
        }
    }
}

/// z-normalize `values`: subtract the mean, divide by the population
/// standard deviation. Near-constant series normalize to all-zeros.
pub fn zscore(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std < STD_EPSILON {
        vec![0.0; values.len()]
    } else {
        values.iter().map(|v| (v - mean) / std).collect()
    }
}

fn gaussian_breakpoints(cardinality: usize) -> Vec<f64> {
    (1..cardinality)
        .map(|i| norm_quantile((i as f64) / (cardinality as f64)))
        .collect()
}

// Acklam's rational approximation to the quantile function of the
// standard normal distribution, |relative error| < 1.15e-9.
fn norm_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= (1.0 - P_LOW) {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

#[cfg(test)]
#[path = "sax_test.rs"]
mod sax_test;
