use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{env, fs, path};

use super::*;

fn temp_dir(name: &str) -> ffi::OsString {
    let dir: path::PathBuf = [
        env::temp_dir(),
        format!("tsdms-pindex-{}-{}", name, random::<u64>()).into(),
    ]
    .iter()
    .collect();
    fs::create_dir_all(&dir).unwrap();
    dir.into_os_string()
}

#[test]
fn test_pindex_basic() {
    let dir = temp_dir("basic");

    let (mut pindex, _) = Pindex::open(&dir).unwrap();
    assert_eq!(pindex.len(), 0);
    assert_eq!(pindex.to_seqno(), 0);

    assert_eq!(pindex.put("ts-0", 8, 0).unwrap(), 1);
    assert_eq!(pindex.put("ts-1", 1608, 34).unwrap(), 2);
    assert_eq!(pindex.get("ts-0"), Some((8, 0)));
    assert_eq!(pindex.get("ts-1"), Some((1608, 34)));
    assert!(pindex.contains("ts-0"));
    assert_eq!(pindex.len(), 2);

    assert_eq!(pindex.delete("ts-0").unwrap(), 3);
    assert_eq!(pindex.get("ts-0"), None);
    assert_eq!(pindex.len(), 1);

    fs::remove_dir_all(&dir).unwrap();
}

// recovery without a snapshot: the log alone is authoritative.
#[test]
fn test_pindex_replay() {
    let dir = temp_dir("replay");

    let (mut pindex, _) = Pindex::open(&dir).unwrap();
    pindex.put("ts-0", 8, 0).unwrap();
    pindex.put("ts-1", 1608, 34).unwrap();
    pindex.delete("ts-0").unwrap();
    std::mem::drop(pindex); // no snapshot taken

    let (pindex, trig_entries) = Pindex::open(&dir).unwrap();
    assert!(trig_entries.is_empty());
    assert_eq!(pindex.to_seqno(), 3);
    assert_eq!(pindex.get("ts-0"), None);
    assert_eq!(pindex.get("ts-1"), Some((1608, 34)));

    fs::remove_dir_all(&dir).unwrap();
}

// recovery with a snapshot plus trailing log entries.
#[test]
fn test_pindex_snapshot_then_replay() {
    let dir = temp_dir("snapshot");

    let (mut pindex, _) = Pindex::open(&dir).unwrap();
    pindex.put("ts-0", 8, 0).unwrap();
    pindex.put("ts-1", 1608, 34).unwrap();
    pindex.snapshot(&dir).unwrap();
    pindex.put("ts-2", 3208, 68).unwrap();
    pindex.delete("ts-1").unwrap();
    std::mem::drop(pindex);

    let (pindex, _) = Pindex::open(&dir).unwrap();
    assert_eq!(pindex.to_seqno(), 4);
    assert_eq!(pindex.get("ts-0"), Some((8, 0)));
    assert_eq!(pindex.get("ts-1"), None);
    assert_eq!(pindex.get("ts-2"), Some((3208, 68)));

    fs::remove_dir_all(&dir).unwrap();
}

// trigger entries ride the log and come back out on open.
#[test]
fn test_pindex_journal_triggers() {
    use crate::trigger::{OpKind, Trigger};

    let dir = temp_dir("triggers");

    let (mut pindex, _) = Pindex::open(&dir).unwrap();
    pindex.put("ts-0", 8, 0).unwrap();
    let trigger = Trigger::new("stats", OpKind::InsertTs, vec!["mean".to_string()], None);
    let seqno = pindex
        .journal(Op::TrigPut {
            trigger: trigger.clone(),
        })
        .unwrap();
    assert_eq!(seqno, 2);
    std::mem::drop(pindex);

    let (pindex, trig_entries) = Pindex::open(&dir).unwrap();
    assert_eq!(pindex.to_seqno(), 2);
    assert_eq!(trig_entries.len(), 1);
    assert_eq!(trig_entries[0].seqno, 2);
    match &trig_entries[0].op {
        Op::TrigPut { trigger: t } => assert_eq!(t, &trigger),
        op => panic!("unexpected {:?}", op),
    }

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_pindex_random_ops() {
    let seed: u64 = random();
    println!("test_pindex_random_ops {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let dir = temp_dir("random");
    let (mut pindex, _) = Pindex::open(&dir).unwrap();
    let mut model: std::collections::BTreeMap<String, (u64, u64)> = Default::default();

    for i in 0..500 {
        let pk = format!("ts-{}", rng.gen::<u64>() % 64);
        match rng.gen::<u8>() % 3 {
            0 | 1 => {
                let offs = (rng.gen::<u64>() % 10_000, rng.gen::<u64>() % 10_000);
                pindex.put(&pk, offs.0, offs.1).unwrap();
                model.insert(pk, offs);
            }
            2 => {
                if model.remove(&pk).is_some() {
                    pindex.delete(&pk).unwrap();
                }
            }
            _ => unreachable!(),
        }
        if (i % 100) == 99 {
            pindex.snapshot(&dir).unwrap();
        }
    }
    std::mem::drop(pindex);

    let (pindex, _) = Pindex::open(&dir).unwrap();
    let flat: Vec<(String, (u64, u64))> =
        pindex.iter().map(|(pk, offs)| (pk.clone(), *offs)).collect();
    let expected: Vec<(String, (u64, u64))> =
        model.iter().map(|(pk, offs)| (pk.clone(), *offs)).collect();
    assert_eq!(flat, expected);

    fs::remove_dir_all(&dir).unwrap();
}
