//! Module `trigger` implement the table binding procedures to
//! database operations.

use cbordata::Cborize;

use std::{convert::TryFrom, ffi, fmt, fs};

use crate::{err_at, util, Error, Result};

/// File name of the trigger-table snapshot, under the database
/// directory.
pub const TRIGGER_FILE: &str = "triggers.idx";

const TRIGGER_VER: u32 = 0x00030001;

/// Database operations a trigger can bind to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    InsertTs,
    UpsertMeta,
    DeleteTs,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpKind::InsertTs => write!(f, "insert_ts"),
            OpKind::UpsertMeta => write!(f, "upsert_meta"),
            OpKind::DeleteTs => write!(f, "delete_ts"),
        }
    }
}

impl OpKind {
    pub(crate) fn to_code(self) -> u64 {
        match self {
            OpKind::InsertTs => 0,
            OpKind::UpsertMeta => 1,
            OpKind::DeleteTs => 2,
        }
    }

    pub(crate) fn from_code(code: u64) -> Result<OpKind> {
        match code {
            0 => Ok(OpKind::InsertTs),
            1 => Ok(OpKind::UpsertMeta),
            2 => Ok(OpKind::DeleteTs),
            n => err_at!(Integrity, msg: "op kind {}", n),
        }
    }
}

/// A trigger: after `onwhat` commits on a primary key, run procedure
/// `proc` over the key's series and assign its outputs to the
/// `target` metadata fields. `arg` is an optional numeric parameter
/// passed through to the procedure.
#[derive(Clone, Debug, PartialEq)]
pub struct Trigger {
    pub proc: String,
    pub onwhat: OpKind,
    pub target: Vec<String>,
    pub arg: Option<Vec<f64>>,
}

impl Trigger {
    pub fn new(
        proc: &str,
        onwhat: OpKind,
        target: Vec<String>,
        arg: Option<Vec<f64>>,
    ) -> Trigger {
        let arg = match arg {
            Some(arg) if arg.is_empty() => None,
            arg => arg,
        };
        Trigger {
            proc: proc.to_string(),
            onwhat,
            target,
            arg,
        }
    }
}

/// Mapping of operation to the triggers bound to it, in insertion
/// order. Snapshot to `triggers.idx`; mutations are additionally
/// journaled through the write-ahead-log, the table cannot be
/// reconstructed from the heaps.
pub struct TriggerTable {
    triggers: Vec<Trigger>,
    seqno: u64, // seqno of the last applied mutation
}

impl Default for TriggerTable {
    fn default() -> TriggerTable {
        TriggerTable {
            triggers: Vec::default(),
            seqno: 0,
        }
    }
}

impl TriggerTable {
    /// Append `trigger`, the operation's firing order is insertion
    /// order.
    pub fn add(&mut self, trigger: Trigger, seqno: u64) {
        self.triggers.push(trigger);
        self.seqno = seqno;
    }

    /// Remove the first trigger matching (`proc`, `onwhat`).
    pub fn remove(&mut self, proc: &str, onwhat: OpKind, seqno: u64) -> Result<Trigger> {
        match self
            .triggers
            .iter()
            .position(|t| t.proc == proc && t.onwhat == onwhat)
        {
            Some(off) => {
                self.seqno = seqno;
                Ok(self.triggers.remove(off))
            }
            None => err_at!(NotFound, msg: "trigger {} on {}", proc, onwhat),
        }
    }

    /// Triggers bound to `onwhat`, in firing order.
    pub fn for_op(&self, onwhat: OpKind) -> Vec<Trigger> {
        self.triggers
            .iter()
            .filter(|t| t.onwhat == onwhat)
            .cloned()
            .collect()
    }

    /// Return true if any trigger assigns to field `name`.
    pub fn targets_field(&self, name: &str) -> bool {
        self.triggers
            .iter()
            .any(|t| t.target.iter().any(|f| f == name))
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    #[inline]
    pub fn to_seqno(&self) -> u64 {
        self.seqno
    }

    /// Snapshot the table to `triggers.idx` under `dir`.
    pub fn snapshot(&self, dir: &ffi::OsStr, seqno: u64) -> Result<()> {
        let triggers = self.triggers.iter().cloned().map(DiskTrigger::from).collect();
        let dt = DiskTable { seqno, triggers };
        let data = util::into_cbor_bytes(dt)?;
        util::write_snapshot(&util::to_location(dir, TRIGGER_FILE), &data)
    }

    /// Load the table from `triggers.idx` under `dir`. A missing
    /// snapshot yields an empty table at seqno ZERO; mutations since
    /// are replayed from the log by the caller.
    pub fn load(dir: &ffi::OsStr) -> Result<TriggerTable> {
        let loc = util::to_location(dir, TRIGGER_FILE);
        if fs::metadata(&loc).is_err() {
            return Ok(TriggerTable::default());
        }

        let data = util::read_snapshot(&loc)?;
        let (dt, _) = util::from_cbor_bytes::<DiskTable>(&data)?;

        let mut triggers = Vec::with_capacity(dt.triggers.len());
        for t in dt.triggers.into_iter() {
            triggers.push(Trigger::try_from(t)?);
        }
        Ok(TriggerTable {
            triggers,
            seqno: dt.seqno,
        })
    }
}

#[derive(Clone, Debug, Cborize)]
struct DiskTrigger {
    proc: String,
    onwhat: u64,
    target: Vec<String>,
    arg: Vec<u64>, // f64 bit-patterns, empty means no arg
}

impl DiskTrigger {
    const ID: u32 = TRIGGER_VER;
}

impl From<Trigger> for DiskTrigger {
    fn from(t: Trigger) -> DiskTrigger {
        DiskTrigger {
            proc: t.proc,
            onwhat: t.onwhat.to_code(),
            target: t.target,
            arg: t
                .arg
                .unwrap_or_default()
                .into_iter()
                .map(f64::to_bits)
                .collect(),
        }
    }
}

impl TryFrom<DiskTrigger> for Trigger {
    type Error = Error;

    fn try_from(dt: DiskTrigger) -> Result<Trigger> {
        let arg = match dt.arg.len() {
            0 => None,
            _ => Some(dt.arg.into_iter().map(f64::from_bits).collect()),
        };
        Ok(Trigger {
            proc: dt.proc,
            onwhat: OpKind::from_code(dt.onwhat)?,
            target: dt.target,
            arg,
        })
    }
}

#[derive(Clone, Debug, Cborize)]
struct DiskTable {
    seqno: u64,
    triggers: Vec<DiskTrigger>,
}

impl DiskTable {
    const ID: u32 = TRIGGER_VER;
}

#[cfg(test)]
#[path = "trigger_test.rs"]
mod trigger_test;
