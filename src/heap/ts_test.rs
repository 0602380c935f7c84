use rand::{prelude::random, rngs::SmallRng, SeedableRng};

use std::{env, fs, path};

use crate::TimeSeries;

use super::*;

fn temp_dir(name: &str) -> ffi::OsString {
    let dir: path::PathBuf = [
        env::temp_dir(),
        format!("tsdms-heap-{}-{}", name, random::<u64>()).into(),
    ]
    .iter()
    .collect();
    fs::create_dir_all(&dir).unwrap();
    dir.into_os_string()
}

#[test]
fn test_ts_heap_roundtrip() {
    let seed: u64 = random();
    println!("test_ts_heap_roundtrip {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let dir = temp_dir("roundtrip");
    let mut heap = TsHeap::open(&dir, 32).unwrap();

    let mut items: Vec<(u64, TimeSeries)> = vec![];
    for _ in 0..50 {
        let ts = TimeSeries::random(&mut rng, 32);
        let off = heap.append(&ts).unwrap();
        items.push((off, ts));
    }
    assert_eq!(heap.count().unwrap(), 50);

    for (off, ts) in items.iter() {
        assert_eq!(&heap.read(*off).unwrap(), ts);
    }

    // offsets are sequential with stride 16*L.
    for (i, (off, _)) in items.iter().enumerate() {
        assert_eq!(*off, 8 + (i as u64) * 16 * 32);
    }

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_ts_heap_header_mismatch() {
    let dir = temp_dir("mismatch");
    let heap = TsHeap::open(&dir, 32).unwrap();
    std::mem::drop(heap);

    match TsHeap::open(&dir, 64) {
        Err(Error::SchemaMismatch(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_ts_heap_partial_tail() {
    let seed: u64 = random();
    println!("test_ts_heap_partial_tail {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let dir = temp_dir("tail");
    let mut heap = TsHeap::open(&dir, 16).unwrap();
    let ts = TimeSeries::random(&mut rng, 16);
    let off = heap.append(&ts).unwrap();
    std::mem::drop(heap);

    // simulate a crash mid-record.
    let loc = crate::util::to_location(&dir, TS_HEAP_FILE);
    let mut data = fs::read(&loc).unwrap();
    data.extend_from_slice(&[1, 2, 3, 4, 5]);
    fs::write(&loc, &data).unwrap();

    let mut heap = TsHeap::open(&dir, 16).unwrap();
    assert_eq!(heap.count().unwrap(), 1);
    assert_eq!(heap.read(off).unwrap(), ts);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_ts_heap_bad_offset() {
    let seed: u64 = random();
    println!("test_ts_heap_bad_offset {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let dir = temp_dir("offset");
    let mut heap = TsHeap::open(&dir, 16).unwrap();
    heap.append(&TimeSeries::random(&mut rng, 16)).unwrap();

    for off in [0_u64, 9, 8 + 16 * 16].iter() {
        match heap.read(*off) {
            Err(Error::Integrity(_, _)) => (),
            res => panic!("offset {} unexpected {:?}", off, res.map(|_| ())),
        }
    }

    match heap.append(&TimeSeries::random(&mut rng, 8)) {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    fs::remove_dir_all(&dir).unwrap();
}
