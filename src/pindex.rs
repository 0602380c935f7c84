//! Module `pindex` implement the primary index, an ordered mapping
//! of primary key to heap offsets.
//!
//! The index has two halves that must not be collapsed: the
//! authoritative in-memory map, and the log that makes it durable.
//! Mutations append to the log first (the commit point, see [wal])
//! and touch the map only after the fsync returns. The snapshot file
//! `pk.idx` is an optimization, it bounds replay work on recovery;
//! after writing it the log is truncated.
//!
//! [wal]: crate::wal

use cbordata::Cborize;

use std::{cmp, collections::BTreeMap, ffi, fs};

use crate::{
    err_at, util,
    wal::{Entry, Op, Wlog},
    Error, Result,
};

/// File name of the primary-index snapshot, under the database
/// directory.
pub const INDEX_FILE: &str = "pk.idx";

const PINDEX_VER: u32 = 0x00040001;

/// Primary index: `pk -> (ts_off, meta_off)` plus the database's
/// mutation sequence-number.
///
/// `meta_epoch` counts metadata-heap rewrites. The descriptor carries
/// the same counter; the pair disagreeing on open means a rewrite was
/// interrupted before its offset remap landed, and the storage
/// manager recovers it (see `Tsdms::open`).
pub struct Pindex {
    map: BTreeMap<String, (u64, u64)>,
    seqno: u64,      // highest committed seqno
    meta_epoch: u64, // metadata-heap layout generation
    log: Wlog,
}

impl Pindex {
    /// Open the primary index under `dir`: load the snapshot, then
    /// replay the log over it. Trigger-table entries found in the
    /// log are returned for the caller to apply; the map is
    /// authoritative when this returns.
    pub fn open(dir: &ffi::OsStr) -> Result<(Pindex, Vec<Entry>)> {
        let loc = util::to_location(dir, INDEX_FILE);
        let (mut map, snap_seqno, meta_epoch) = if fs::metadata(&loc).is_ok() {
            let data = util::read_snapshot(&loc)?;
            let (ds, _) = util::from_cbor_bytes::<DiskSnapshot>(&data)?;
            let mut map = BTreeMap::new();
            for e in ds.entries.into_iter() {
                map.insert(e.pk, (e.ts_off, e.meta_off));
            }
            (map, ds.seqno, ds.meta_epoch)
        } else {
            (BTreeMap::new(), 0, 0)
        };

        let (log, entries) = Wlog::open(dir)?;

        let (mut seqno, mut trig_entries) = (snap_seqno, vec![]);
        for entry in entries.into_iter() {
            seqno = cmp::max(seqno, entry.to_seqno());
            match &entry.op {
                Op::Put {
                    pk,
                    ts_off,
                    meta_off,
                } if entry.seqno > snap_seqno => {
                    map.insert(pk.clone(), (*ts_off, *meta_off));
                }
                Op::Del { pk } if entry.seqno > snap_seqno => {
                    map.remove(pk);
                }
                Op::Put { .. } | Op::Del { .. } => (), // covered by snapshot
                // trigger ops filter against the trigger-table's own
                // seqno, the caller owns that.
                Op::TrigPut { .. } | Op::TrigDel { .. } => trig_entries.push(entry),
            }
        }

        let index = Pindex {
            map,
            seqno,
            meta_epoch,
            log,
        };
        Ok((index, trig_entries))
    }

    /// Commit `pk -> (ts_off, meta_off)`. Returns the entry's seqno.
    pub fn put(&mut self, pk: &str, ts_off: u64, meta_off: u64) -> Result<u64> {
        let seqno = self.seqno + 1;
        let op = Op::Put {
            pk: pk.to_string(),
            ts_off,
            meta_off,
        };
        self.log.append(Entry::new(seqno, op))?; // commit point
        self.map.insert(pk.to_string(), (ts_off, meta_off));
        self.seqno = seqno;
        Ok(seqno)
    }

    /// Commit removal of `pk`. Returns the entry's seqno.
    pub fn delete(&mut self, pk: &str) -> Result<u64> {
        let seqno = self.seqno + 1;
        let op = Op::Del { pk: pk.to_string() };
        self.log.append(Entry::new(seqno, op))?; // commit point
        self.map.remove(pk);
        self.seqno = seqno;
        Ok(seqno)
    }

    /// Commit a trigger-table mutation. The entry is journaled under
    /// the next seqno but does not touch the map.
    pub fn journal(&mut self, op: Op) -> Result<u64> {
        let seqno = self.seqno + 1;
        self.log.append(Entry::new(seqno, op))?; // commit point
        self.seqno = seqno;
        Ok(seqno)
    }

    pub fn get(&self, pk: &str) -> Option<(u64, u64)> {
        self.map.get(pk).copied()
    }

    pub fn contains(&self, pk: &str) -> bool {
        self.map.contains_key(pk)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &(u64, u64))> {
        self.map.iter()
    }

    /// Primary keys, in order.
    pub fn pks(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    #[inline]
    pub fn to_seqno(&self) -> u64 {
        self.seqno
    }

    /// Metadata-heap layout generation this index's offsets belong to.
    #[inline]
    pub fn to_meta_epoch(&self) -> u64 {
        self.meta_epoch
    }

    pub fn set_meta_epoch(&mut self, meta_epoch: u64) {
        self.meta_epoch = meta_epoch;
    }

    /// Rewrite every entry's meta offset after a metadata-heap
    /// rewrite. Caller must snapshot immediately after.
    pub fn set_meta_offsets(&mut self, offsets: &BTreeMap<String, u64>) -> Result<()> {
        for (pk, meta_off) in offsets.iter() {
            match self.map.get_mut(pk) {
                Some(value) => value.1 = *meta_off,
                None => err_at!(Fatal, msg: "no such pk {:?} rewriting offsets", pk)?,
            }
        }
        Ok(())
    }

    /// Snapshot the map to `pk.idx` and truncate the log.
    pub fn snapshot(&mut self, dir: &ffi::OsStr) -> Result<()> {
        let entries = self
            .map
            .iter()
            .map(|(pk, (ts_off, meta_off))| DiskPk {
                pk: pk.clone(),
                ts_off: *ts_off,
                meta_off: *meta_off,
            })
            .collect();
        let ds = DiskSnapshot {
            seqno: self.seqno,
            meta_epoch: self.meta_epoch,
            entries,
        };
        let data = util::into_cbor_bytes(ds)?;
        util::write_snapshot(&util::to_location(dir, INDEX_FILE), &data)?;

        self.log.reset()
    }
}

#[derive(Clone, Debug, Cborize)]
struct DiskPk {
    pk: String,
    ts_off: u64,
    meta_off: u64,
}

impl DiskPk {
    const ID: u32 = PINDEX_VER;
}

#[derive(Clone, Debug, Cborize)]
struct DiskSnapshot {
    seqno: u64,
    meta_epoch: u64,
    entries: Vec<DiskPk>,
}

impl DiskSnapshot {
    const ID: u32 = PINDEX_VER;
}

#[cfg(test)]
#[path = "pindex_test.rs"]
mod pindex_test;
