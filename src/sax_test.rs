use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_breakpoints() {
    // c=4 quartile breakpoints of N(0,1).
    let sax = Sax::new(4, 4).unwrap();
    let expected = [-0.6745, 0.0, 0.6745];
    for (bp, exp) in sax.breakpoints.iter().zip(expected.iter()) {
        assert!((bp - exp).abs() < 1e-3, "{} {}", bp, exp);
    }

    // breakpoints are symmetric and increasing for every cardinality.
    for c in [2_usize, 8, 16, 64, 256].iter() {
        let sax = Sax::new(4, *c).unwrap();
        assert_eq!(sax.breakpoints.len(), c - 1);
        for w in sax.breakpoints.windows(2) {
            assert!(w[0] < w[1]);
        }
        let mid = (c - 1) / 2;
        if (c % 2) == 0 {
            assert!(sax.breakpoints[mid].abs() < 1e-12);
        }
    }

    assert!(Sax::new(4, 3).is_err());
    assert!(Sax::new(4, 512).is_err());
    assert!(Sax::new(0, 4).is_err());
}

#[test]
fn test_zscore() {
    let zs = zscore(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    let mean: f64 = zs.iter().sum::<f64>() / 5.0;
    let var: f64 = zs.iter().map(|v| v * v).sum::<f64>() / 5.0;
    assert!(mean.abs() < 1e-12);
    assert!((var - 1.0).abs() < 1e-12);

    // near-constant series normalize to all-zeros.
    assert_eq!(zscore(&[3.0, 3.0, 3.0, 3.0]), vec![0.0; 4]);
}

#[test]
fn test_encode() {
    let sax = Sax::new(4, 4).unwrap();

    // ramp: segment means are strictly increasing, symbols must be
    // non-decreasing and span the low and high bands.
    let values: Vec<f64> = (0..16).map(|i| i as f64).collect();
    let word = sax.encode(&values).unwrap();
    assert_eq!(word.len(), 4);
    assert_eq!(word[0], 0);
    assert_eq!(word[3], 3);
    for w in word.windows(2) {
        assert!(w[0] <= w[1]);
    }

    // constant series encodes to the band holding zero.
    let word = sax.encode(&[5.5; 16]).unwrap();
    assert!(word.iter().all(|s| *s == word[0]));

    // symbols stay within the alphabet.
    let seed: u64 = random();
    println!("test_encode {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);
    for _ in 0..50 {
        let values: Vec<f64> = (0..32).map(|_| rng.gen_range(-10.0..10.0)).collect();
        let word = sax.encode(&values).unwrap();
        assert!(word.iter().all(|s| (*s as usize) < sax.to_cardinality()));
    }

    // length must be a multiple of the word length.
    assert!(sax.encode(&values_of(10)).is_err());
    assert!(sax.encode(&[]).is_err());
}

fn values_of(n: usize) -> Vec<f64> {
    (0..n).map(|i| i as f64).collect()
}

#[test]
fn test_symbol_distance() {
    let sax = Sax::new(4, 8).unwrap();
    assert_eq!(sax.symbol_distance(3, 3), 0.0);
    assert!(sax.symbol_distance(0, 7) > sax.symbol_distance(3, 4));
    // symmetric.
    assert_eq!(sax.symbol_distance(1, 6), sax.symbol_distance(6, 1));
}

#[test]
fn test_norm_quantile() {
    assert!(norm_quantile(0.5).abs() < 1e-9);
    assert!((norm_quantile(0.975) - 1.959964).abs() < 1e-4);
    assert!((norm_quantile(0.025) + 1.959964).abs() < 1e-4);
    // extreme tails stay finite and ordered.
    assert!(norm_quantile(0.001) < norm_quantile(0.01));
}
