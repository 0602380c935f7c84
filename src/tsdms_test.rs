use rand::{prelude::random, rngs::SmallRng, SeedableRng};

use std::{env, path};

use crate::isax::split_position;

use super::*;

fn new_config(name: &str, ts_length: usize) -> (Config, ffi::OsString) {
    let dir: path::PathBuf = [
        env::temp_dir(),
        format!("tsdms-db-{}", random::<u64>()).into(),
    ]
    .iter()
    .collect();
    let dir = dir.into_os_string();
    (Config::new(&dir, name, ts_length), dir)
}

fn sin_series() -> TimeSeries {
    let times: Vec<f64> = (0..100).map(|i| (i as f64) * 0.01).collect();
    let values: Vec<f64> = times
        .iter()
        .map(|t| (2.0 * std::f64::consts::PI * t).sin())
        .collect();
    TimeSeries::new(times, values).unwrap()
}

fn pk_eq(pk: &str) -> Vec<(String, Cmp)> {
    vec![(
        PK_FIELD.to_string(),
        Cmp::Eq(Value::Str(pk.to_string())),
    )]
}

fn float_field(name: &str) -> Field {
    Field::new(name, FieldType::Float, Value::Float(0.0), IndexKind::None).unwrap()
}

// seed scenario 1: a round-trip through heap and select.
#[test]
fn test_insert_select_ts() {
    let (config, dir) = new_config("scn1", 100);
    let mut db = Tsdms::create(config).unwrap();

    let ts = sin_series();
    db.insert_ts("ts-0", &ts).unwrap();

    let fields = vec![TS_FIELD.to_string()];
    let rows = db
        .select(&pk_eq("ts-0"), Some(&fields), &Additional::default())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].pk, "ts-0");
    assert_eq!(rows[0].ts.as_ref().unwrap(), &ts);
    assert!(rows[0].md.is_empty());

    // duplicate keys are rejected.
    match db.insert_ts("ts-0", &ts) {
        Err(Error::AlreadyExists(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    // wrong length is rejected.
    let short = TimeSeries::new(vec![0.0, 1.0], vec![0.0, 0.0]).unwrap();
    match db.insert_ts("ts-1", &short) {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

// seed scenario 2: a stats trigger fills mean/std on insert.
#[test]
fn test_stats_trigger() {
    let (config, dir) = new_config("scn2", 100);
    let mut db = Tsdms::create(config).unwrap();

    db.add_field(float_field("mean")).unwrap();
    db.add_field(float_field("std")).unwrap();
    db.add_trigger(
        "stats",
        OpKind::InsertTs,
        vec!["mean".to_string(), "std".to_string()],
        None,
    )
    .unwrap();

    db.insert_ts("ts-0", &sin_series()).unwrap();

    let fields = vec!["mean".to_string(), "std".to_string()];
    let rows = db
        .select(&pk_eq("ts-0"), Some(&fields), &Additional::default())
        .unwrap();
    assert_eq!(rows.len(), 1);
    let mean = rows[0].md["mean"].as_f64().unwrap();
    let std = rows[0].md["std"].as_f64().unwrap();
    assert!(mean.abs() < 1e-4, "mean {}", mean);
    assert!((std - 0.5_f64.sqrt()).abs() < 1e-4, "std {}", std);

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

// seed scenarios 3 and 4: vantage points and restart-stable search.
#[test]
fn test_vantage_points() {
    let seed: u64 = 0xcafe_f00d_dead_beef;
    println!("test_vantage_points {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let (config, dir) = new_config("scn3", 100);
    let mut db = Tsdms::create(config.clone()).unwrap();

    let mut series = vec![];
    for i in 0..50 {
        let ts = TimeSeries::random(&mut rng, 100);
        db.insert_ts(&format!("ts-{}", i), &ts).unwrap();
        series.push(ts);
    }

    let vps = [3_usize, 16, 18, 25, 49];
    for k in vps.iter() {
        db.insert_vp(&format!("ts-{}", k)).unwrap();
    }
    let mut want: Vec<String> = vps.iter().map(|k| format!("ts-{}", k)).collect();
    want.sort();
    assert_eq!(db.vps().unwrap(), want);

    // every pk carries every distance field, and each vantage point
    // is at distance zero from itself.
    for i in 0..50 {
        let md = db.get_meta(&format!("ts-{}", i)).unwrap();
        for k in vps.iter() {
            let dname = format!("d_vp_ts-{}", k);
            let d = md[&dname].as_f64().unwrap();
            assert!(d >= 0.0 && d <= 2.0, "{} {}", dname, d);
        }
    }
    for k in vps.iter() {
        let pk = format!("ts-{}", k);
        let md = db.get_meta(&pk).unwrap();
        assert_eq!(md[&format!("d_vp_{}", pk)], Value::Float(0.0));
        assert_eq!(md[schema::VP_FIELD], Value::Bool(true));
    }

    // scenario 4: search, restart, search again, bitwise equal.
    let query = TimeSeries::random(&mut rng, 100);
    let before = db.vp_similarity_search(&query, 1).unwrap();
    assert_eq!(before.len(), 1);
    db.close().unwrap();

    let mut db = Tsdms::open(config).unwrap();
    let after = db.vp_similarity_search(&query, 1).unwrap();
    assert_eq!(before, after);

    // the top hit is the true nearest, brute-forced.
    let mut best: Option<(String, f64)> = None;
    for (i, ts) in series.iter().enumerate() {
        let d = crate::vpoint::distance(&query, ts).unwrap();
        let pk = format!("ts-{}", i);
        if best.as_ref().map_or(true, |(_, bd)| d < *bd) {
            best = Some((pk, d));
        }
    }
    assert_eq!(after[0], best.unwrap());

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

// seed scenario 5: iSAX terminals stay within threshold.
#[test]
fn test_isax_thresholds() {
    let seed: u64 = random();
    println!("test_isax_thresholds {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let (mut config, dir) = new_config("scn5", 100);
    config.set_word_len(4).set_cardinality(4).set_threshold(5);
    let mut db = Tsdms::create(config).unwrap();

    for i in 0..50 {
        let ts = TimeSeries::random(&mut rng, 100);
        db.insert_ts(&format!("ts-{}", i), &ts).unwrap();
    }
    assert_eq!(db.isax.len(), 50);

    for entries in db.isax.terminals() {
        if entries.len() > db.isax.to_threshold() {
            assert!(split_position(entries).is_none(), "{:?}", entries);
        }
    }

    // the approximate query lands on something.
    let query = TimeSeries::random(&mut rng, 100);
    assert!(db.isax_similarity_search(&query).unwrap().is_some());

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

// seed scenario 6: deletion leaves no trace in any index.
#[test]
fn test_delete_ts() {
    let seed: u64 = random();
    println!("test_delete_ts {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let (config, dir) = new_config("scn6", 100);
    let mut db = Tsdms::create(config).unwrap();

    for i in 0..20 {
        let ts = TimeSeries::random(&mut rng, 100);
        db.insert_ts(&format!("ts-{}", i), &ts).unwrap();
    }
    db.insert_vp("ts-2").unwrap();

    let old_md = db.get_meta("ts-17").unwrap();
    db.delete_ts("ts-17").unwrap();

    assert!(db
        .select(&pk_eq("ts-17"), None, &Additional::default())
        .unwrap()
        .is_empty());
    assert!(!db.isax_contains("ts-17").unwrap());
    for (name, index) in db.indexes.iter() {
        let set = index.query(&Cmp::Eq(old_md[name].clone())).unwrap();
        assert!(!set.contains("ts-17"), "index {:?}", name);
    }
    assert!(!db.contains("ts-17"));
    assert_eq!(db.len(), 19);

    match db.delete_ts("ts-17") {
        Err(Error::NotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

// dropping the handle without a flush is a crash at the last fsync
// boundary; recovery must reconstruct the same state.
#[test]
fn test_crash_recovery() {
    let seed: u64 = random();
    println!("test_crash_recovery {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let (mut config, dir) = new_config("crash", 64);
    config.set_flush_every(1000); // keep everything in the log
    let mut db = Tsdms::create(config.clone()).unwrap();

    db.add_field(float_field("mean")).unwrap();
    db.add_field(float_field("std")).unwrap();
    db.add_trigger(
        "stats",
        OpKind::InsertTs,
        vec!["mean".to_string(), "std".to_string()],
        None,
    )
    .unwrap();
    for i in 0..17 {
        db.insert_ts(&format!("ts-{}", i), &TimeSeries::random(&mut rng, 64))
            .unwrap();
    }
    db.delete_ts("ts-4").unwrap();
    let mut md = BTreeMap::new();
    md.insert("mean".to_string(), Value::Float(42.0));
    db.upsert_meta("ts-5", &md).unwrap();

    let want: Vec<Row> = db.select(&[], None, &Additional::default()).unwrap();
    let want_seqno = db.stats().unwrap().seqno;
    mem::drop(db); // no flush, the log is authoritative

    let mut db = Tsdms::open(config).unwrap();
    assert_eq!(db.stats().unwrap().seqno, want_seqno);
    let got: Vec<Row> = db.select(&[], None, &Additional::default()).unwrap();
    assert_eq!(got.len(), want.len());
    for (a, b) in want.iter().zip(got.iter()) {
        assert_eq!(a.pk, b.pk);
        assert_eq!(a.md, b.md);
    }
    assert_eq!(db.triggers.len(), 1);

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

// a crash inside the schema rewrite leaves one of two states: a
// staged heap that never committed, or a committed descriptor whose
// heap rename and offset remap are pending. open must discard the
// former, finish the latter, and refuse anything torn.
#[test]
fn test_rewrite_crash_recovery() {
    let seed: u64 = random();
    println!("test_rewrite_crash_recovery {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let (config, dir) = new_config("rewrite", 32);
    let mut db = Tsdms::create(config.clone()).unwrap();
    db.add_field(
        Field::new("score", FieldType::Int, Value::Int(0), IndexKind::Ordered).unwrap(),
    )
    .unwrap();
    for i in 0..5 {
        db.insert_ts(&format!("ts-{}", i), &TimeSeries::random(&mut rng, 32))
            .unwrap();
        let mut md = BTreeMap::new();
        md.insert("score".to_string(), Value::Int(i * 10));
        db.upsert_meta(&format!("ts-{}", i), &md).unwrap();
    }
    let want: Vec<Row> = db.select(&[], None, &Additional::default()).unwrap();
    let old_schema = db.schema.clone();
    let epoch = db.meta_epoch;
    db.close().unwrap();

    let db_dir = config.to_db_dir();
    let meta_loc = util::to_location(&db_dir, META_HEAP_FILE);
    let tmp_loc = {
        let mut loc = meta_loc.clone();
        loc.push(".tmp");
        loc
    };

    // crash before the commit point: the stray staged heap is
    // discarded and the old state survives untouched.
    fs::write(&tmp_loc, b"half written staging junk").unwrap();
    let mut db = Tsdms::open(config.clone()).unwrap();
    assert!(fs::metadata(&tmp_loc).is_err());
    let got: Vec<Row> = db.select(&[], None, &Additional::default()).unwrap();
    assert_eq!(got.len(), want.len());
    for (a, b) in want.iter().zip(got.iter()) {
        assert_eq!(a.pk, b.pk);
        assert_eq!(a.md, b.md);
    }
    db.close().unwrap();

    // crash after the commit point: descriptor and heap already
    // carry the new layout, pk.idx still holds old-layout offsets.
    // recovery must remap them and serve identical metadata.
    let mut new_schema = old_schema.clone();
    new_schema
        .add_field(
            Field::new("extra", FieldType::Float, Value::Float(0.0), IndexKind::None).unwrap(),
        )
        .unwrap();
    let mut heap = MetaHeap::create_at(meta_loc.clone(), new_schema.size()).unwrap();
    for row in want.iter() {
        let rec: Vec<Value> = new_schema
            .as_fields()
            .iter()
            .map(|f| row.md.get(&f.name).cloned().unwrap_or_else(|| f.default.clone()))
            .collect();
        heap.append(&new_schema.encode(&rec).unwrap()).unwrap();
    }
    mem::drop(heap);
    Tsdms::write_root(&db_dir, &config, &new_schema, epoch + 1).unwrap();

    let mut db = Tsdms::open(config.clone()).unwrap();
    assert!(db.as_schema().field("extra").is_some());
    for row in want.iter() {
        let md = db.get_meta(&row.pk).unwrap();
        assert_eq!(md["score"], row.md["score"]);
        assert_eq!(md["extra"], Value::Float(0.0));
    }
    // the rebuilt score index still answers.
    let pred = vec![("score".to_string(), Cmp::Ge(Value::Int(30)))];
    let rows = db.select(&pred, None, &Additional::default()).unwrap();
    assert_eq!(rows.len(), 2);
    db.close().unwrap();

    // torn rewrite, one record short of the live set: refused with
    // Integrity, never opened silently.
    let mut heap = MetaHeap::create_at(meta_loc, new_schema.size()).unwrap();
    for row in want.iter().take(4) {
        let rec: Vec<Value> = new_schema
            .as_fields()
            .iter()
            .map(|f| row.md.get(&f.name).cloned().unwrap_or_else(|| f.default.clone()))
            .collect();
        heap.append(&new_schema.encode(&rec).unwrap()).unwrap();
    }
    mem::drop(heap);
    Tsdms::write_root(&db_dir, &config, &new_schema, epoch + 2).unwrap();

    match Tsdms::open(config) {
        Err(Error::Integrity(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_upsert_meta() {
    let (config, dir) = new_config("upsert", 32);
    let mut db = Tsdms::create(config).unwrap();

    let mut rng = SmallRng::seed_from_u64(0);
    db.insert_ts("ts-0", &TimeSeries::random(&mut rng, 32)).unwrap();
    db.add_field(float_field("mean")).unwrap();

    let mut md = BTreeMap::new();
    md.insert("mean".to_string(), Value::Float(1.5));
    db.upsert_meta("ts-0", &md).unwrap();
    assert_eq!(db.get_meta("ts-0").unwrap()["mean"], Value::Float(1.5));

    // idempotent upsert is a no-op on state.
    let seqno = db.stats().unwrap().seqno;
    db.upsert_meta("ts-0", &md).unwrap();
    assert_eq!(db.stats().unwrap().seqno, seqno);

    // unknown and implicit fields are rejected.
    let mut bad = BTreeMap::new();
    bad.insert("nope".to_string(), Value::Float(0.0));
    match db.upsert_meta("ts-0", &bad) {
        Err(Error::SchemaMismatch(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    let mut bad = BTreeMap::new();
    bad.insert(schema::DELETED_FIELD.to_string(), Value::Bool(true));
    match db.upsert_meta("ts-0", &bad) {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match db.upsert_meta("ts-9", &md) {
        Err(Error::NotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_select_sort_limit() {
    let (config, dir) = new_config("sort", 32);
    let mut db = Tsdms::create(config).unwrap();

    db.add_field(
        Field::new("score", FieldType::Int, Value::Int(0), IndexKind::Ordered).unwrap(),
    )
    .unwrap();

    let mut rng = SmallRng::seed_from_u64(7);
    for (pk, score) in [("ts-a", 30), ("ts-b", 10), ("ts-c", 20)].iter() {
        db.insert_ts(pk, &TimeSeries::random(&mut rng, 32)).unwrap();
        let mut md = BTreeMap::new();
        md.insert("score".to_string(), Value::Int(*score));
        db.upsert_meta(pk, &md).unwrap();
    }

    let additional = Additional {
        sort_by: Some("-score".to_string()),
        limit: Some(2),
    };
    let rows = db.select(&[], None, &additional).unwrap();
    let got: Vec<&str> = rows.iter().map(|r| r.pk.as_str()).collect();
    assert_eq!(got, vec!["ts-a", "ts-c"]);

    // indexed range predicate.
    let md = vec![("score".to_string(), Cmp::Ge(Value::Int(20)))];
    let rows = db.select(&md, None, &Additional::default()).unwrap();
    let got: Vec<&str> = rows.iter().map(|r| r.pk.as_str()).collect();
    assert_eq!(got, vec!["ts-a", "ts-c"]);

    // unindexed fields scan.
    db.add_field(float_field("aux")).unwrap();
    let mut md = BTreeMap::new();
    md.insert("aux".to_string(), Value::Float(9.0));
    db.upsert_meta("ts-b", &md).unwrap();
    let pred = vec![("aux".to_string(), Cmp::Gt(Value::Float(1.0)))];
    let rows = db.select(&pred, None, &Additional::default()).unwrap();
    let got: Vec<&str> = rows.iter().map(|r| r.pk.as_str()).collect();
    assert_eq!(got, vec!["ts-b"]);

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_augmented_select() {
    let (config, dir) = new_config("augmented", 100);
    let mut db = Tsdms::create(config).unwrap();

    db.insert_ts("ts-0", &sin_series()).unwrap();

    let target = vec!["mean".to_string(), "std".to_string()];
    let rows = db
        .augmented_select("stats", &target, None, &pk_eq("ts-0"), &Additional::default())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].md["mean"].as_f64().unwrap().abs() < 1e-4);
    assert!((rows[0].md["std"].as_f64().unwrap() - 0.5_f64.sqrt()).abs() < 1e-4);

    // augmented outputs are not persisted.
    assert!(db.get_meta("ts-0").unwrap().get("mean").is_none());

    match db.augmented_select("nope", &target, None, &[], &Additional::default()) {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_delete_vp() {
    let seed: u64 = random();
    println!("test_delete_vp {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let (config, dir) = new_config("delvp", 32);
    let mut db = Tsdms::create(config).unwrap();
    for i in 0..10 {
        db.insert_ts(&format!("ts-{}", i), &TimeSeries::random(&mut rng, 32))
            .unwrap();
    }

    db.insert_vp("ts-3").unwrap();
    assert_eq!(db.vps().unwrap(), vec!["ts-3".to_string()]);
    assert!(db.get_meta("ts-0").unwrap().contains_key("d_vp_ts-3"));

    // series inserted after the vantage point get their distance
    // computed on the way in.
    let late = TimeSeries::random(&mut rng, 32);
    db.insert_ts("ts-late", &late).unwrap();
    let want = crate::vpoint::distance(&late, &db.get_ts("ts-3").unwrap()).unwrap();
    assert_eq!(
        db.get_meta("ts-late").unwrap()["d_vp_ts-3"],
        Value::Float(want)
    );
    db.delete_ts("ts-late").unwrap();

    // distance fields exist iff the pk is a vantage point.
    db.delete_vp("ts-3").unwrap();
    assert!(db.vps().unwrap().is_empty());
    assert!(!db.get_meta("ts-0").unwrap().contains_key("d_vp_ts-3"));
    assert_eq!(
        db.get_meta("ts-3").unwrap()[schema::VP_FIELD],
        Value::Bool(false)
    );

    match db.delete_vp("ts-3") {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match db.insert_vp("ts-99") {
        Err(Error::NotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    // search falls back to a full scan with no vantage points.
    let query = TimeSeries::random(&mut rng, 32);
    assert_eq!(db.vp_similarity_search(&query, 3).unwrap().len(), 3);

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_single_writer_lock() {
    let (config, dir) = new_config("lock", 32);
    let db = Tsdms::create(config.clone()).unwrap();

    match Tsdms::open(config.clone()) {
        Err(Error::IOError(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }

    db.close().unwrap();
    let db = Tsdms::open(config).unwrap();
    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_schema_mismatch_on_open() {
    let (config, dir) = new_config("mismatch", 32);
    Tsdms::create(config.clone()).unwrap().close().unwrap();

    let mut other = config;
    other.ts_length = 64;
    match Tsdms::open(other) {
        Err(Error::SchemaMismatch(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_remove_field_guard() {
    let (config, dir) = new_config("guard", 32);
    let mut db = Tsdms::create(config).unwrap();
    db.add_field(float_field("mean")).unwrap();
    db.add_trigger("stats", OpKind::InsertTs, vec!["mean".to_string()], None)
        .unwrap();

    // a field referenced by a trigger cannot leave the schema.
    match db.remove_field("mean") {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    db.remove_trigger("stats", OpKind::InsertTs).unwrap();
    db.remove_field("mean").unwrap();
    assert!(db.as_schema().field("mean").is_none());

    // implicit fields are off-limits.
    match db.remove_field(schema::DELETED_FIELD) {
        Err(Error::InvalidArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    db.close().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}
