use rand::{prelude::random, rngs::SmallRng, SeedableRng};

use super::*;

#[test]
fn test_timeseries_new() {
    let ts = TimeSeries::new(vec![0.0, 1.0, 2.0], vec![5.0, 6.0, 7.0]).unwrap();
    assert_eq!(ts.len(), 3);
    assert_eq!(ts.as_times(), &[0.0, 1.0, 2.0]);
    assert_eq!(ts.as_values(), &[5.0, 6.0, 7.0]);

    match TimeSeries::new(vec![0.0, 1.0], vec![5.0]) {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match TimeSeries::new(vec![0.0, 1.0, 1.0], vec![5.0, 6.0, 7.0]) {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match TimeSeries::new(vec![1.0, 0.5], vec![5.0, 6.0]) {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
}

#[test]
fn test_timeseries_eq() {
    let seed: u64 = random();
    println!("test_timeseries_eq {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let a = TimeSeries::random(&mut rng, 32);
    let b = a.clone();
    assert_eq!(a, b);

    let (times, mut values) = b.unwrap();
    values[7] += 1.0;
    let c = TimeSeries::new(times, values).unwrap();
    assert!(a != c);
}

#[test]
fn test_validate_pk() {
    assert!(validate_pk("ts-0").is_ok());
    assert!(validate_pk("Series_1.a").is_ok());

    for pk in ["", "a/b", "a:b", "a,b", "a b", "a\nb"].iter() {
        match validate_pk(pk) {
            Err(Error::InvalidArgument(_, _)) => (),
            res => panic!("pk {:?} unexpected {:?}", pk, res),
        }
    }
}
