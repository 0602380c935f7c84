//! Module `wal` implement the write-ahead-log backing the primary
//! index.
//!
//! The log is a single append-only file, `pk.log`, of cbor-encoded
//! op-entries. Appending an entry and fsyncing it is the commit
//! point of every mutation; in-memory state is applied only after
//! the fsync returns. The log is truncated whenever the primary
//! index snapshots itself, the snapshot then covers every entry.
//!
//! Trigger-table mutations ride the same log, they cannot be
//! reconstructed from the heaps.

use cbordata::{Cbor, Cborize, FromCbor};
use log::warn;

use std::{
    convert::TryFrom,
    ffi, fs,
    io::{Seek, SeekFrom},
};

use crate::{
    err_at,
    trigger::{OpKind, Trigger},
    util, write_file, Error, Result,
};

/// File name of the write-ahead-log, under the database directory.
pub const LOG_FILE: &str = "pk.log";

const WAL_VER: u32 = 0x00020001;

/// Logged operation. `Put` covers both fresh inserts and in-place
/// metadata updates, replay is idempotent.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Put {
        pk: String,
        ts_off: u64,
        meta_off: u64,
    },
    Del {
        pk: String,
    },
    TrigPut {
        trigger: Trigger,
    },
    TrigDel {
        proc: String,
        onwhat: OpKind,
    },
}

/// Single op-entry in the write-ahead-log. `seqno` is monotonically
/// increasing across the database's lifetime.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub seqno: u64,
    pub op: Op,
}

impl Entry {
    #[inline]
    pub fn new(seqno: u64, op: Op) -> Entry {
        Entry { seqno, op }
    }

    #[inline]
    pub fn to_seqno(&self) -> u64 {
        self.seqno
    }
}

// Flat disk representation of an entry, one struct for all four ops.
#[derive(Clone, Debug, Cborize)]
struct DiskEntry {
    seqno: u64,
    kind: u64, // 0 put, 1 del, 2 trig-put, 3 trig-del
    pk: String,
    ts_off: u64,
    meta_off: u64,
    proc: String,
    onwhat: u64,
    target: Vec<String>,
    arg: Vec<u64>, // f64 bit-patterns
}

impl DiskEntry {
    const ID: u32 = WAL_VER;
}

impl From<Entry> for DiskEntry {
    fn from(entry: Entry) -> DiskEntry {
        let mut de = DiskEntry {
            seqno: entry.seqno,
            kind: 0,
            pk: String::default(),
            ts_off: 0,
            meta_off: 0,
            proc: String::default(),
            onwhat: 0,
            target: Vec::default(),
            arg: Vec::default(),
        };
        match entry.op {
            Op::Put {
                pk,
                ts_off,
                meta_off,
            } => {
                de.pk = pk;
                de.ts_off = ts_off;
                de.meta_off = meta_off;
            }
            Op::Del { pk } => {
                de.kind = 1;
                de.pk = pk;
            }
            Op::TrigPut { trigger } => {
                de.kind = 2;
                de.proc = trigger.proc;
                de.onwhat = trigger.onwhat.to_code();
                de.target = trigger.target;
                de.arg = trigger
                    .arg
                    .unwrap_or_default()
                    .into_iter()
                    .map(f64::to_bits)
                    .collect();
            }
            Op::TrigDel { proc, onwhat } => {
                de.kind = 3;
                de.proc = proc;
                de.onwhat = onwhat.to_code();
            }
        }
        de
    }
}

impl TryFrom<DiskEntry> for Entry {
    type Error = Error;

    fn try_from(de: DiskEntry) -> Result<Entry> {
        let op = match de.kind {
            0 => Op::Put {
                pk: de.pk,
                ts_off: de.ts_off,
                meta_off: de.meta_off,
            },
            1 => Op::Del { pk: de.pk },
            2 => {
                let arg = match de.arg.len() {
                    0 => None,
                    _ => Some(de.arg.into_iter().map(f64::from_bits).collect()),
                };
                Op::TrigPut {
                    trigger: Trigger {
                        proc: de.proc,
                        onwhat: OpKind::from_code(de.onwhat)?,
                        target: de.target,
                        arg,
                    },
                }
            }
            3 => Op::TrigDel {
                proc: de.proc,
                onwhat: OpKind::from_code(de.onwhat)?,
            },
            kind => err_at!(Integrity, msg: "log entry kind {}", kind)?,
        };
        Ok(Entry::new(de.seqno, op))
    }
}

// The log file. Held open, read-write, for the database's lifetime.
pub struct Wlog {
    loc: ffi::OsString,
    fd: fs::File,
}

impl Wlog {
    /// Open the log under `dir`, creating it if absent, and decode
    /// every committed entry. A partial entry at the tail, left by a
    /// crash between write and fsync, is truncated away; nothing
    /// after it can have been committed.
    pub fn open(dir: &ffi::OsStr) -> Result<(Wlog, Vec<Entry>)> {
        let loc = util::to_location(dir, LOG_FILE);
        let mut fd = util::open_file_cw(&loc)?;

        let len = err_at!(IOError, fd.metadata())?.len();
        err_at!(IOError, fd.seek(SeekFrom::Start(0)))?;

        let (mut entries, mut fpos) = (vec![], 0_u64);
        while fpos < len {
            match Cbor::decode(&mut fd) {
                Ok((val, n)) => {
                    let de = err_at!(FailCbor, DiskEntry::from_cbor(val))?;
                    entries.push(Entry::try_from(de)?);
                    fpos += u64::try_from(n).unwrap();
                }
                Err(_) => {
                    warn!(
                        target: "wal",
                        "truncating partial log tail {} bytes in {:?}", len - fpos, loc
                    );
                    err_at!(IOError, fd.set_len(fpos))?;
                    err_at!(IOError, fd.sync_all())?;
                    break;
                }
            }
        }

        Ok((Wlog { loc, fd }, entries))
    }

    /// Append `entry` and fsync. When this returns Ok the entry is
    /// committed.
    pub fn append(&mut self, entry: Entry) -> Result<()> {
        let data = util::into_cbor_bytes(DiskEntry::from(entry))?;
        err_at!(IOError, self.fd.seek(SeekFrom::End(0)))?;
        write_file!(self.fd, &data, &self.loc, "log entry")?;
        err_at!(IOError, self.fd.sync_data())?;
        Ok(())
    }

    /// Truncate the log. Called right after a primary-index
    /// snapshot, which then covers every logged entry.
    pub fn reset(&mut self) -> Result<()> {
        err_at!(IOError, self.fd.set_len(0))?;
        err_at!(IOError, self.fd.sync_all())?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "wal_test.rs"]
mod wal_test;
