//! Module `heap` implement the two fixed-record binary stores, one
//! holding raw series and the other holding packed metadata records.
//!
//! Heap files are append-oriented; metadata records can additionally
//! be overwritten in place, record granularity. Records are never
//! moved, a record's byte offset is its identity and is what the
//! primary index stores. Partial records at the tail, left behind by
//! a crash mid-write, are truncated on open; such records are by
//! construction unreferenced, the write-ahead-log entry that would
//! have referenced them was never committed.

mod meta;
mod ts;

pub use crate::heap::meta::MetaHeap;
pub use crate::heap::ts::TsHeap;

/// File name of the series heap, under the database directory.
pub const TS_HEAP_FILE: &str = "heap_ts.met";
/// File name of the metadata heap, under the database directory.
pub const META_HEAP_FILE: &str = "heap_meta.met";
