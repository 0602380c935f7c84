//! Module `index` implement typed secondary indexes over metadata
//! fields.
//!
//! Two variants: an ordered-tree index for high-cardinality fields
//! and a bitmap index for low-cardinality fields, behind one tagged
//! [Index] type with a common capability set. Both are maintained in
//! lockstep with the primary store and persist as best-effort
//! snapshots; an index found missing, stale or corrupt on startup is
//! rebuilt by streaming the metadata heap through the primary index.

use log::warn;

use std::{collections::BTreeSet, ffi, fs};

use crate::{
    err_at,
    schema::{Field, IndexKind, Value},
    Error, Result,
};

mod bitmap;
mod ordered;

pub use crate::index::bitmap::BitmapIndex;
pub use crate::index::ordered::OrderedIndex;

/// Comparison predicate over a single field. A select predicate is a
/// conjunction of (field, Cmp) pairs.
#[derive(Clone, Debug)]
pub enum Cmp {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    In(Vec<Value>),
}

impl Cmp {
    /// Evaluate `stored CMP self`, the scan path for fields without
    /// a secondary index.
    pub fn eval(&self, stored: &Value) -> bool {
        match self {
            Cmp::Eq(v) => stored == v,
            Cmp::Ne(v) => stored != v,
            Cmp::Lt(v) => stored < v,
            Cmp::Le(v) => stored <= v,
            Cmp::Gt(v) => stored > v,
            Cmp::Ge(v) => stored >= v,
            Cmp::In(vs) => vs.iter().any(|v| stored == v),
        }
    }
}

/// Compose the location of the index file for `field` under `dir`.
pub fn index_location(dir: &ffi::OsStr, field: &str) -> ffi::OsString {
    crate::util::to_location(dir, &format!("index_{}.idx", field))
}

/// Compose the location of the bitmap variant's slot-map file.
pub fn slots_location(dir: &ffi::OsStr, field: &str) -> ffi::OsString {
    crate::util::to_location(dir, &format!("index_{}_pks.idx", field))
}

/// Secondary index over one metadata field.
pub enum Index {
    Ordered(OrderedIndex),
    Bitmap(BitmapIndex),
}

impl Index {
    /// Create an empty index for `field`, per its declaration.
    pub fn new(field: &Field) -> Result<Index> {
        match field.index {
            IndexKind::Ordered => Ok(Index::Ordered(OrderedIndex::new(&field.name))),
            IndexKind::Bitmap => Ok(Index::Bitmap(BitmapIndex::new(&field.name))),
            IndexKind::None => err_at!(Fatal, msg: "field {:?} is not indexed", field.name),
        }
    }

    pub fn insert(&mut self, value: &Value, pk: &str) -> Result<()> {
        match self {
            Index::Ordered(index) => index.insert(value, pk),
            Index::Bitmap(index) => index.insert(value, pk),
        }
    }

    pub fn remove(&mut self, value: &Value, pk: &str) -> Result<()> {
        match self {
            Index::Ordered(index) => index.remove(value, pk),
            Index::Bitmap(index) => index.remove(value, pk),
        }
    }

    /// Primary keys whose field value satisfies `cmp`.
    pub fn query(&self, cmp: &Cmp) -> Result<BTreeSet<String>> {
        match self {
            Index::Ordered(index) => index.query(cmp),
            Index::Bitmap(index) => index.query(cmp),
        }
    }

    /// Number of distinct values currently indexed.
    pub fn len(&self) -> usize {
        match self {
            Index::Ordered(index) => index.len(),
            Index::Bitmap(index) => index.len(),
        }
    }

    /// Persist a best-effort snapshot tagged with `seqno`.
    pub fn snapshot(&self, dir: &ffi::OsStr, seqno: u64) -> Result<()> {
        match self {
            Index::Ordered(index) => index.snapshot(dir, seqno),
            Index::Bitmap(index) => index.snapshot(dir, seqno),
        }
    }

    /// Load the snapshot for `field`, provided it is tagged with
    /// `seqno`. Returns None, asking for a rebuild, when the
    /// snapshot is missing, stale or fails its integrity check.
    pub fn load(dir: &ffi::OsStr, field: &Field, seqno: u64) -> Result<Option<Index>> {
        let res = match field.index {
            IndexKind::Ordered => OrderedIndex::load(dir, &field.name).map(|o| {
                o.map(|(index, snap_seqno)| (Index::Ordered(index), snap_seqno))
            }),
            IndexKind::Bitmap => BitmapIndex::load(dir, &field.name).map(|o| {
                o.map(|(index, snap_seqno)| (Index::Bitmap(index), snap_seqno))
            }),
            IndexKind::None => return err_at!(Fatal, msg: "field {:?} is not indexed", field.name),
        };
        match res {
            Ok(Some((index, snap_seqno))) if snap_seqno == seqno => Ok(Some(index)),
            Ok(Some((_, snap_seqno))) => {
                warn!(
                    target: "index",
                    "stale index for {:?} at seqno {}/{}", field.name, snap_seqno, seqno
                );
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(target: "index", "corrupt index for {:?}: {}", field.name, err);
                Ok(None)
            }
        }
    }

    /// Remove the on-disk snapshot files for `field`, used when the
    /// field is dropped from the schema.
    pub fn purge(dir: &ffi::OsStr, field: &str) -> Result<()> {
        fs::remove_file(&index_location(dir, field)).ok();
        fs::remove_file(&slots_location(dir, field)).ok();
        Ok(())
    }
}
