//! Package `tsdms` implement a persistent store for fixed-length
//! time-series, along with secondary indexes on user-defined metadata
//! and two similarity-search structures.
//!
//! A database instance is a directory on the local file-system. Raw
//! series and metadata records are kept in two fixed-record heap
//! files, while a primary index maps each series' primary-key to its
//! heap offsets. The primary index is made crash-safe by routing
//! every mutation through a write-ahead-log; periodically, and on
//! shutdown, the in-memory state is snapshot to disk and the log is
//! truncated. Secondary indexes, the trigger-table and the iSAX tree
//! are best-effort snapshots, rebuilt from the heaps whenever they
//! are found missing, stale or corrupt.
//!
//! Every mutation has a single commit-point, the fsync of its log
//! entry. State changes become visible only after the commit-point,
//! and recovery replays the log over the last snapshot. Refer to
//! [Tsdms] for the user-visible operations.
//!
//! Similarity search comes in two flavours:
//!
//! * [iSAX][isax], an n-ary tree over symbolic-aggregate-approximation
//!   words, for approximate nearest-neighbor queries.
//! * Vantage-points, reference series whose distances to every stored
//!   series are cached in indexed metadata fields and pruned via the
//!   triangle inequality.
//!
//! [isax]: https://www.cs.ucr.edu/~eamonn/iSAX_2.0.pdf

#![allow(clippy::len_without_is_empty)]

mod error;
mod util;

mod config;
pub mod heap;
pub mod index;
mod isax;
mod pindex;
mod procs;
mod sax;
mod schema;
mod trigger;
mod tsdms;
mod types;
mod vpoint;
mod wal;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::index::Cmp;
pub use crate::isax::IsaxTree;
pub use crate::procs::Registry;
pub use crate::sax::Sax;
pub use crate::schema::{Field, FieldType, IndexKind, Schema, Value};
pub use crate::trigger::{OpKind, Trigger};
pub use crate::tsdms::{Additional, Row, Stats, Tsdms};
pub use crate::types::TimeSeries;
pub use crate::vpoint::distance;

/// Type alias for Result return type, used by this package.
pub type Result<T> = std::result::Result<T, Error>;
