//! Module `tsdms` implement the storage manager, composing the
//! heaps, the primary index, the secondary indexes, the trigger
//! table and the similarity-search structures.
//!
//! [Tsdms] is an explicit handle over one open database; there is no
//! process-wide state. Mutations are serialized by the `&mut self`
//! receivers, and an exclusive lock on the database directory keeps
//! other processes out. Triggers run post-commit; a trigger's
//! metadata writes go through a non-firing upsert, re-entrancy
//! cannot loop.

use cbordata::Cborize;
use fs2::FileExt;
use log::{debug, warn};

use std::{
    cmp,
    collections::{BTreeMap, BTreeSet},
    convert::TryFrom,
    ffi, fs, mem,
};

use crate::{
    err_at,
    heap::{MetaHeap, TsHeap, META_HEAP_FILE},
    index::{Cmp, Index},
    isax::IsaxTree,
    pindex::Pindex,
    procs::Registry,
    sax::Sax,
    schema::{self, DiskSchema, Field, FieldType, IndexKind, Schema, Value},
    trigger::{OpKind, Trigger, TriggerTable},
    types, util, vpoint,
    wal::Op,
    Config, Error, Result, TimeSeries,
};

/// File name of the database descriptor, schema plus creation
/// parameters, under the database directory.
pub const SCHEMA_FILE: &str = "schema.idx";
/// Lock file held exclusively by the opening process.
pub const LOCK_FILE: &str = "FLOCK";

/// Pseudo-field naming the raw series in select projections and
/// predicates on the primary key.
pub const PK_FIELD: &str = "pk";
/// Pseudo-field naming the raw series in select projections.
pub const TS_FIELD: &str = "ts";

// upper bound of the cross-correlation distance.
const MAX_DISTANCE: f64 = 2.0;

const ROOT_VER: u32 = 0x00080001;

/// One row of a select result.
#[derive(Clone, Debug)]
pub struct Row {
    pub pk: String,
    pub md: BTreeMap<String, Value>,
    pub ts: Option<TimeSeries>,
}

/// Ordering and limit applied after predicate evaluation. `sort_by`
/// takes `+field` or `-field`; without it rows come ordered by pk.
#[derive(Clone, Debug, Default)]
pub struct Additional {
    pub sort_by: Option<String>,
    pub limit: Option<usize>,
}

/// Point-in-time statistics for an open database.
#[derive(Clone, Debug)]
pub struct Stats {
    pub n_live: usize,
    pub n_ts_records: u64,
    pub n_meta_records: u64,
    pub seqno: u64,
    pub n_indexes: usize,
    pub n_triggers: usize,
    pub n_vps: usize,
    pub n_isax: usize,
}

/// Storage manager for one database instance.
///
/// Refer to the package documentation for the write path and the
/// recovery path; the user-visible operations are the methods here.
pub struct Tsdms {
    config: Config,
    dir: ffi::OsString,
    _lockf: fs::File,
    schema: Schema,
    ts_heap: TsHeap,
    meta_heap: MetaHeap,
    pindex: Pindex,
    indexes: BTreeMap<String, Index>,
    triggers: TriggerTable,
    registry: Registry,
    sax: Sax,
    isax: IsaxTree,
    meta_epoch: u64, // metadata-heap layout generation
    n_ops: usize,    // mutations since the last flush
}

impl Tsdms {
    /// Create a fresh database under `<config.dir>/<config.name>`.
    /// Fails with AlreadyExists when the directory already holds one.
    pub fn create(config: Config) -> Result<Tsdms> {
        config.validate()?;
        let dir = config.to_db_dir();
        err_at!(IOError, fs::create_dir_all(&dir))?;
        if fs::metadata(&util::to_location(&dir, SCHEMA_FILE)).is_ok() {
            err_at!(AlreadyExists, msg: "database under {:?}", dir)?
        }
        let lockf = Self::lock_dir(&dir)?;

        let schema = Schema::new();
        let sax = Sax::new(config.word_len, config.cardinality)?;
        Self::write_root(&dir, &config, &schema, 0)?;

        let ts_heap = TsHeap::open(&dir, config.ts_length)?;
        let meta_heap = MetaHeap::open(&dir, schema.size())?;
        let (pindex, _) = Pindex::open(&dir)?;

        let mut indexes = BTreeMap::new();
        for field in schema.as_fields().iter() {
            if field.index != IndexKind::None {
                indexes.insert(field.name.clone(), Index::new(field)?);
            }
        }

        let isax = IsaxTree::new(config.word_len, config.threshold);
        let mut db = Tsdms {
            dir,
            _lockf: lockf,
            schema,
            ts_heap,
            meta_heap,
            pindex,
            indexes,
            triggers: TriggerTable::default(),
            registry: Registry::default(),
            sax,
            isax,
            meta_epoch: 0,
            n_ops: 0,
            config,
        };
        db.flush()?;
        Ok(db)
    }

    /// Open an existing database, running recovery: load the
    /// primary-index snapshot, replay the log, verify heap offsets,
    /// and load or rebuild every auxiliary structure.
    pub fn open(config: Config) -> Result<Tsdms> {
        let dir = config.to_db_dir();
        if fs::metadata(&util::to_location(&dir, SCHEMA_FILE)).is_err() {
            err_at!(InvalidFile, msg: "no database under {:?}", dir)?
        }
        let lockf = Self::lock_dir(&dir)?;

        let root = Self::read_root(&dir)?;
        if root.ts_length != (config.ts_length as u64) {
            err_at!(
                SchemaMismatch,
                msg: "ts_length {}/{}", config.ts_length, root.ts_length
            )?
        }
        let mut config = config;
        config.word_len = root.word_len as usize;
        config.cardinality = root.cardinality as usize;
        config.threshold = root.threshold as usize;
        config.validate()?;

        let schema = Schema::try_from(root.schema)?;
        let sax = Sax::new(config.word_len, config.cardinality)?;

        let ts_heap = TsHeap::open(&dir, config.ts_length)?;
        let (mut pindex, trig_entries) = Pindex::open(&dir)?;

        // Metadata-heap rewrite recovery. The descriptor, carrying
        // `meta_epoch`, is the rewrite's commit point; the heap
        // rename and the primary-index offset remap come after it
        // and may still be pending. The heap can therefore never be
        // NEWER than the descriptor; a descriptor ahead of the
        // primary index tells us which side of the rename we
        // crashed on by whether the staged file is still present.
        let meta_loc = util::to_location(&dir, META_HEAP_FILE);
        let tmp_loc = {
            let mut loc = meta_loc.clone();
            loc.push(".tmp");
            loc
        };
        let staged = fs::metadata(&tmp_loc).is_ok();
        let remap = match (staged, root.meta_epoch.cmp(&pindex.to_meta_epoch())) {
            (true, cmp::Ordering::Greater) => {
                warn!(target: "tsdms", "completing interrupted schema rewrite");
                err_at!(IOError, fs::rename(&tmp_loc, &meta_loc))?;
                true
            }
            (true, cmp::Ordering::Equal) => {
                // rewrite aborted before its commit point.
                warn!(target: "tsdms", "discarding staged schema rewrite");
                fs::remove_file(&tmp_loc).ok();
                false
            }
            (false, cmp::Ordering::Greater) => true,
            (false, cmp::Ordering::Equal) => false,
            (_, cmp::Ordering::Less) => err_at!(
                Integrity,
                msg: "descriptor epoch {} behind index epoch {}",
                root.meta_epoch, pindex.to_meta_epoch()
            )?,
        };

        let meta_heap = MetaHeap::open(&dir, schema.size())?;
        if remap {
            // the rewrite streams live records in key order, the
            // k-th key sits at k * R; anything else is corruption.
            let n_records = meta_heap.count()?;
            if n_records != (pindex.len() as u64) {
                err_at!(
                    Integrity,
                    msg: "rewritten meta-heap holds {} records for {} keys",
                    n_records, pindex.len()
                )?
            }
            let reclen = schema.size() as u64;
            let offsets: BTreeMap<String, u64> = pindex
                .pks()
                .into_iter()
                .enumerate()
                .map(|(k, pk)| (pk, (k as u64) * reclen))
                .collect();
            pindex.set_meta_offsets(&offsets)?;
            pindex.set_meta_epoch(root.meta_epoch);
        }

        // every committed pk must point at well-formed records, else
        // refuse to open.
        for (pk, (ts_off, meta_off)) in pindex.iter() {
            ts_heap
                .validate_offset(*ts_off)
                .map_err(|e| prefix_pk(e, pk))?;
            meta_heap
                .validate_offset(*meta_off)
                .map_err(|e| prefix_pk(e, pk))?;
        }

        let mut triggers = TriggerTable::load(&dir)?;
        for entry in trig_entries.into_iter() {
            if entry.seqno <= triggers.to_seqno() {
                continue;
            }
            match entry.op {
                Op::TrigPut { trigger } => triggers.add(trigger, entry.seqno),
                Op::TrigDel { proc, onwhat } => {
                    if let Err(err) = triggers.remove(&proc, onwhat, entry.seqno) {
                        warn!(target: "tsdms", "replaying trigger removal: {}", err);
                    }
                }
                _ => unreachable!(),
            }
        }

        let isax = IsaxTree::new(config.word_len, config.threshold);
        let mut db = Tsdms {
            dir,
            _lockf: lockf,
            schema,
            ts_heap,
            meta_heap,
            pindex,
            indexes: BTreeMap::new(),
            triggers,
            registry: Registry::default(),
            sax,
            isax,
            meta_epoch: root.meta_epoch,
            n_ops: 0,
            config,
        };
        db.load_indexes()?;
        db.load_isax()?;
        if remap {
            // persist the recovered offsets so the next open is
            // ordinary.
            db.flush()?;
        }
        Ok(db)
    }

    /// Flush everything and release the database. The lock file is
    /// unlocked when the handle drops.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    fn lock_dir(dir: &ffi::OsStr) -> Result<fs::File> {
        let lockf = util::open_file_cw(&util::to_location(dir, LOCK_FILE))?;
        err_at!(
            IOError,
            lockf.try_lock_exclusive(),
            "database {:?} locked by another process",
            dir
        )?;
        Ok(lockf)
    }

    fn write_root(
        dir: &ffi::OsStr,
        config: &Config,
        schema: &Schema,
        meta_epoch: u64,
    ) -> Result<()> {
        let root = DiskRoot {
            ts_length: config.ts_length as u64,
            word_len: config.word_len as u64,
            cardinality: config.cardinality as u64,
            threshold: config.threshold as u64,
            meta_epoch,
            schema: schema.clone().into(),
        };
        let data = util::into_cbor_bytes(root)?;
        util::write_snapshot(&util::to_location(dir, SCHEMA_FILE), &data)
    }

    fn read_root(dir: &ffi::OsStr) -> Result<DiskRoot> {
        let data = util::read_snapshot(&util::to_location(dir, SCHEMA_FILE))?;
        let (root, _) = util::from_cbor_bytes::<DiskRoot>(&data)?;
        Ok(root)
    }

    fn load_indexes(&mut self) -> Result<()> {
        let seqno = self.pindex.to_seqno();
        let fields: Vec<Field> = self
            .schema
            .as_fields()
            .iter()
            .filter(|f| f.index != IndexKind::None)
            .cloned()
            .collect();
        for field in fields {
            let index = match Index::load(&self.dir, &field, seqno)? {
                Some(index) => index,
                None => {
                    warn!(target: "tsdms", "rebuilding index for {:?}", field.name);
                    self.rebuild_index(&field)?
                }
            };
            self.indexes.insert(field.name.clone(), index);
        }
        Ok(())
    }

    // stream the metadata heap through the primary index.
    fn rebuild_index(&mut self, field: &Field) -> Result<Index> {
        let mut index = Index::new(field)?;
        let pos = self.schema.field(&field.name).unwrap().0;
        let items: Vec<(String, u64)> = self
            .pindex
            .iter()
            .map(|(pk, (_, meta_off))| (pk.clone(), *meta_off))
            .collect();
        for (pk, meta_off) in items {
            let record = self.schema.decode(&self.meta_heap.read(meta_off)?)?;
            index.insert(&record[pos], &pk)?;
        }
        Ok(index)
    }

    fn load_isax(&mut self) -> Result<()> {
        let seqno = self.pindex.to_seqno();
        let loaded = IsaxTree::load(&self.dir, self.config.word_len, self.config.threshold)?;
        self.isax = match loaded {
            Some((tree, snap_seqno)) if snap_seqno == seqno => tree,
            _ => {
                warn!(target: "tsdms", "rebuilding isax tree at seqno {}", seqno);
                self.rebuild_isax()?
            }
        };
        Ok(())
    }

    // re-encode every live series from the heap.
    fn rebuild_isax(&mut self) -> Result<IsaxTree> {
        let mut tree = IsaxTree::new(self.config.word_len, self.config.threshold);
        let items: Vec<(String, u64)> = self
            .pindex
            .iter()
            .map(|(pk, (ts_off, _))| (pk.clone(), *ts_off))
            .collect();
        for (pk, ts_off) in items {
            let ts = self.ts_heap.read(ts_off)?;
            tree.insert(&pk, self.sax.encode(ts.as_values())?)?;
        }
        Ok(tree)
    }

    /// Insert a fresh series under `pk`. Fails with AlreadyExists
    /// when the key is present.
    pub fn insert_ts(&mut self, pk: &str, ts: &TimeSeries) -> Result<()> {
        types::validate_pk(pk)?;
        if ts.len() != self.config.ts_length {
            err_at!(
                InvalidArgument,
                msg: "series length {}/{}", ts.len(), self.config.ts_length
            )?
        }
        if self.pindex.contains(pk) {
            err_at!(AlreadyExists, msg: "pk {:?}", pk)?
        }

        let ts_off = self.ts_heap.append(ts)?;
        let record = self.new_record(pk, ts)?;
        let meta_off = self.meta_heap.append(&self.schema.encode(&record)?)?;
        self.pindex.put(pk, ts_off, meta_off)?; // commit point

        self.index_record(pk, &record, true)?;
        let word = self.sax.encode(ts.as_values())?;
        self.isax.insert(pk, word)?;

        self.fire_triggers(OpKind::InsertTs, pk, ts);
        self.tick()
    }

    // default metadata for a fresh pk; distance fields are computed
    // against each vantage point's stored series.
    fn new_record(&mut self, pk: &str, ts: &TimeSeries) -> Result<Vec<Value>> {
        let vp_fields: Vec<(usize, String)> = self
            .schema
            .as_fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| f.name.starts_with(schema::D_VP_PREFIX))
            .map(|(pos, f)| (pos, f.name[schema::D_VP_PREFIX.len()..].to_string()))
            .collect();

        let mut record = self.schema.default_record();
        for (pos, vp_pk) in vp_fields {
            let d = if vp_pk == pk {
                0.0
            } else {
                match self.pindex.get(&vp_pk) {
                    Some((vts_off, _)) => vpoint::distance(ts, &self.ts_heap.read(vts_off)?)?,
                    None => err_at!(Fatal, msg: "vantage point {:?} missing", vp_pk)?,
                }
            };
            record[pos] = Value::Float(d);
        }
        Ok(record)
    }

    // insert, or remove, a record's values into the secondary
    // indexes.
    fn index_record(&mut self, pk: &str, record: &[Value], add: bool) -> Result<()> {
        let fields: Vec<(usize, String)> = self
            .schema
            .as_fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| f.index != IndexKind::None)
            .map(|(pos, f)| (pos, f.name.clone()))
            .collect();
        for (pos, name) in fields {
            if let Some(index) = self.indexes.get_mut(&name) {
                if add {
                    index.insert(&record[pos], pk)?;
                } else {
                    index.remove(&record[pos], pk)?;
                }
            }
        }
        Ok(())
    }

    /// Merge `md` into the key's metadata. Unknown fields are
    /// rejected; an upsert that changes nothing is a no-op.
    pub fn upsert_meta(&mut self, pk: &str, md: &BTreeMap<String, Value>) -> Result<()> {
        for name in md.keys() {
            if schema::is_implicit(name) {
                err_at!(InvalidArgument, msg: "implicit field {:?}", name)?
            }
        }
        self.upsert_meta_inner(pk, md, true)?;
        self.tick()
    }

    fn upsert_meta_inner(
        &mut self,
        pk: &str,
        md: &BTreeMap<String, Value>,
        fire: bool,
    ) -> Result<()> {
        let (ts_off, meta_off) = match self.pindex.get(pk) {
            Some(offs) => offs,
            None => err_at!(NotFound, msg: "pk {:?}", pk)?,
        };

        let old = self.schema.decode(&self.meta_heap.read(meta_off)?)?;
        let mut new = old.clone();
        let mut changed: Vec<(usize, String)> = vec![];
        for (name, value) in md.iter() {
            let (pos, field) = match self.schema.field(name) {
                Some(item) => item,
                None => err_at!(SchemaMismatch, msg: "unknown field {:?}", name)?,
            };
            if !value.matches(&field.ftype) {
                err_at!(SchemaMismatch, msg: "value {} for field {:?}", value, name)?
            }
            if new[pos] != *value {
                new[pos] = value.clone();
                changed.push((pos, name.clone()));
            }
        }
        if changed.is_empty() {
            return Ok(());
        }

        let data = self.schema.encode(&new)?;
        self.pindex.put(pk, ts_off, meta_off)?; // commit point
        self.meta_heap.overwrite(meta_off, &data)?;

        for (pos, name) in changed {
            if let Some(index) = self.indexes.get_mut(&name) {
                index.remove(&old[pos], pk)?;
                index.insert(&new[pos], pk)?;
            }
        }

        if fire {
            let ts = self.ts_heap.read(ts_off)?;
            self.fire_triggers(OpKind::UpsertMeta, pk, &ts);
        }
        Ok(())
    }

    /// Logically delete `pk`: tombstone its metadata record, drop it
    /// from every index and from the iSAX tree. Heap slots are
    /// retained until compaction.
    pub fn delete_ts(&mut self, pk: &str) -> Result<()> {
        let (ts_off, meta_off) = match self.pindex.get(pk) {
            Some(offs) => offs,
            None => err_at!(NotFound, msg: "pk {:?}", pk)?,
        };
        let old = self.schema.decode(&self.meta_heap.read(meta_off)?)?;
        let ts = self.ts_heap.read(ts_off)?;

        self.pindex.delete(pk)?; // commit point

        let mut rec = old.clone();
        let deleted_pos = self.schema.field(schema::DELETED_FIELD).unwrap().0;
        rec[deleted_pos] = Value::Bool(true);
        self.meta_heap.overwrite(meta_off, &self.schema.encode(&rec)?)?;

        self.index_record(pk, &old, false)?;
        let word = self.sax.encode(ts.as_values())?;
        self.isax.remove(pk, &word);

        self.fire_triggers(OpKind::DeleteTs, pk, &ts);
        self.tick()
    }

    // post-commit trigger execution; procedure errors are surfaced
    // per row through the log, they do not abort the enclosing
    // operation. Trigger-driven metadata writes do not re-fire.
    fn fire_triggers(&mut self, onwhat: OpKind, pk: &str, ts: &TimeSeries) {
        for t in self.triggers.for_op(onwhat) {
            let proc = match self.registry.get(&t.proc) {
                Some(proc) => proc,
                None => {
                    warn!(target: "tsdms", "unknown proc {:?}, trigger skipped", t.proc);
                    continue;
                }
            };
            let outs = match proc(ts, t.arg.as_deref()) {
                Ok(outs) => outs,
                Err(err) => {
                    warn!(target: "tsdms", "trigger {:?} on {:?}: {}", t.proc, pk, err);
                    continue;
                }
            };
            if outs.len() != t.target.len() {
                warn!(
                    target: "tsdms",
                    "trigger {:?} arity {}/{}", t.proc, outs.len(), t.target.len()
                );
                continue;
            }
            let md: BTreeMap<String, Value> = t.target.iter().cloned().zip(outs).collect();
            if let Err(err) = self.upsert_meta_inner(pk, &md, false) {
                warn!(target: "tsdms", "trigger {:?} on {:?}: {}", t.proc, pk, err);
            }
        }
    }

    /// Evaluate the conjunctive predicate `md` and return matching
    /// rows. `fields` projects the metadata; the pseudo-field `ts`
    /// materializes the raw series. Rows come ordered by pk, or by
    /// `additional.sort_by`.
    pub fn select(
        &mut self,
        md: &[(String, Cmp)],
        fields: Option<&[String]>,
        additional: &Additional,
    ) -> Result<Vec<Row>> {
        let mut candidates: Option<BTreeSet<String>> = None;
        let mut scans: Vec<(usize, Cmp)> = vec![];
        for (name, cmp) in md.iter() {
            if name == PK_FIELD {
                let set = self.query_pk(cmp)?;
                candidates = Some(intersect(candidates, set));
            } else if let Some(index) = self.indexes.get(name) {
                let set = index.query(cmp)?;
                candidates = Some(intersect(candidates, set));
            } else if let Some((pos, _)) = self.schema.field(name) {
                scans.push((pos, cmp.clone()));
            } else {
                err_at!(SchemaMismatch, msg: "unknown field {:?}", name)?
            }
        }

        let pks: Vec<String> = match candidates {
            Some(set) => set.into_iter().collect(),
            None => self.pindex.pks(),
        };

        // materialize, applying unindexed conjuncts by scanning.
        let want_ts = fields.map_or(false, |fs| fs.iter().any(|f| f == TS_FIELD));
        let mut rows = vec![];
        for pk in pks {
            let (ts_off, meta_off) = match self.pindex.get(&pk) {
                Some(offs) => offs,
                None => continue,
            };
            let record = self.schema.decode(&self.meta_heap.read(meta_off)?)?;
            if !scans.iter().all(|(pos, cmp)| cmp.eval(&record[*pos])) {
                continue;
            }
            let ts = if want_ts {
                Some(self.ts_heap.read(ts_off)?)
            } else {
                None
            };
            rows.push(Row {
                pk,
                md: self.schema.to_map(&record),
                ts,
            });
        }

        // order, limit, project.
        if let Some(by) = &additional.sort_by {
            let (name, desc) = match by.strip_prefix('-') {
                Some(name) => (name, true),
                None => (by.strip_prefix('+').unwrap_or(by), false),
            };
            if self.schema.field(name).is_none() {
                err_at!(InvalidArgument, msg: "sort_by field {:?}", name)?
            }
            rows.sort_by(|a, b| {
                let ord = a.md.get(name).cmp(&b.md.get(name));
                if desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = additional.limit {
            rows.truncate(limit);
        }
        if let Some(fs) = fields {
            for f in fs.iter() {
                if f != TS_FIELD && self.schema.field(f).is_none() {
                    err_at!(SchemaMismatch, msg: "unknown field {:?}", f)?
                }
            }
            for row in rows.iter_mut() {
                row.md.retain(|name, _| fs.iter().any(|f| f == name));
            }
        }
        Ok(rows)
    }

    // predicate over the key space itself.
    fn query_pk(&self, cmp: &Cmp) -> Result<BTreeSet<String>> {
        let mut acc = BTreeSet::new();
        match cmp {
            Cmp::Eq(Value::Str(pk)) => {
                if self.pindex.contains(pk) {
                    acc.insert(pk.clone());
                }
            }
            Cmp::In(values) => {
                for value in values.iter() {
                    match value {
                        Value::Str(pk) if self.pindex.contains(pk) => {
                            acc.insert(pk.clone());
                        }
                        _ => (),
                    }
                }
            }
            cmp => {
                for (pk, _) in self.pindex.iter() {
                    if cmp.eval(&Value::Str(pk.clone())) {
                        acc.insert(pk.clone());
                    }
                }
            }
        }
        Ok(acc)
    }

    /// As [Tsdms::select], then run `proc` over each matching row's
    /// series and assign its outputs to the `target` names in the
    /// row. Row-level procedure failures are logged and leave the
    /// row unaugmented.
    pub fn augmented_select(
        &mut self,
        proc: &str,
        target: &[String],
        arg: Option<&[f64]>,
        md: &[(String, Cmp)],
        additional: &Additional,
    ) -> Result<Vec<Row>> {
        let proc_fn = match self.registry.get(proc) {
            Some(proc_fn) => proc_fn,
            None => err_at!(InvalidArgument, msg: "unknown proc {:?}", proc)?,
        };

        let mut rows = self.select(md, None, additional)?;
        for row in rows.iter_mut() {
            let ts = match row.ts.clone() {
                Some(ts) => ts,
                None => match self.pindex.get(&row.pk) {
                    Some((ts_off, _)) => self.ts_heap.read(ts_off)?,
                    None => continue,
                },
            };
            match proc_fn(&ts, arg) {
                Ok(outs) if outs.len() == target.len() => {
                    for (name, value) in target.iter().zip(outs.into_iter()) {
                        row.md.insert(name.clone(), value);
                    }
                }
                Ok(outs) => warn!(
                    target: "tsdms",
                    "proc {:?} arity {}/{}", proc, outs.len(), target.len()
                ),
                Err(err) => warn!(target: "tsdms", "proc {:?} on {:?}: {}", proc, row.pk, err),
            }
        }
        Ok(rows)
    }

    /// Bind `proc` to fire after `onwhat` commits. Target fields
    /// must exist and not be implicit; an unregistered proc name is
    /// accepted and skipped at fire time.
    pub fn add_trigger(
        &mut self,
        proc: &str,
        onwhat: OpKind,
        target: Vec<String>,
        arg: Option<Vec<f64>>,
    ) -> Result<()> {
        for name in target.iter() {
            match self.schema.field(name) {
                Some(_) if schema::is_implicit(name) => {
                    err_at!(InvalidArgument, msg: "implicit target {:?}", name)?
                }
                Some(_) => (),
                None => err_at!(SchemaMismatch, msg: "unknown target field {:?}", name)?,
            }
        }
        if !self.registry.contains(proc) {
            warn!(target: "tsdms", "proc {:?} not registered, trigger will skip", proc);
        }

        let trigger = Trigger::new(proc, onwhat, target, arg);
        let seqno = self.pindex.journal(Op::TrigPut {
            trigger: trigger.clone(),
        })?; // commit point
        self.triggers.add(trigger, seqno);
        self.tick()
    }

    /// Remove the first trigger matching (`proc`, `onwhat`).
    pub fn remove_trigger(&mut self, proc: &str, onwhat: OpKind) -> Result<()> {
        if self.triggers.for_op(onwhat).iter().all(|t| t.proc != proc) {
            err_at!(NotFound, msg: "trigger {} on {}", proc, onwhat)?
        }
        let seqno = self.pindex.journal(Op::TrigDel {
            proc: proc.to_string(),
            onwhat,
        })?; // commit point
        self.triggers.remove(proc, onwhat, seqno)?;
        self.tick()
    }

    /// Append a user field to the schema, rewriting the metadata
    /// heap with defaults for the new field.
    pub fn add_field(&mut self, field: Field) -> Result<()> {
        if schema::is_implicit(&field.name) {
            err_at!(InvalidArgument, msg: "implicit field {:?}", field.name)?
        }
        self.add_field_inner(field)
    }

    fn add_field_inner(&mut self, field: Field) -> Result<()> {
        let mut schema = self.schema.clone();
        schema.add_field(field.clone())?;
        self.rewrite_meta(schema)?;

        if field.index != IndexKind::None {
            let mut index = Index::new(&field)?;
            for pk in self.pindex.pks() {
                index.insert(&field.default, &pk)?;
            }
            self.indexes.insert(field.name.clone(), index);
        }
        self.flush()
    }

    /// Remove a user field. Rejected for implicit fields and for
    /// fields referenced by a registered trigger.
    pub fn remove_field(&mut self, name: &str) -> Result<()> {
        if schema::is_implicit(name) {
            err_at!(InvalidArgument, msg: "implicit field {:?}", name)?
        }
        self.remove_field_inner(name)
    }

    fn remove_field_inner(&mut self, name: &str) -> Result<()> {
        let field = match self.schema.field(name) {
            Some((_, field)) => field.clone(),
            None => err_at!(SchemaMismatch, msg: "unknown field {:?}", name)?,
        };
        if self.triggers.targets_field(name) {
            err_at!(InvalidArgument, msg: "field {:?} referenced by a trigger", name)?
        }

        let mut schema = self.schema.clone();
        schema.remove_field(name)?;
        self.rewrite_meta(schema)?;

        if field.index != IndexKind::None {
            self.indexes.remove(name);
            Index::purge(&self.dir, name)?;
        }
        self.flush()
    }

    // Schema evolution: stage a fresh heap alongside the old one,
    // re-encoding every live record (surviving fields keep their
    // values, added fields take defaults). Writing the descriptor
    // with the bumped `meta_epoch` is the commit point; only then is
    // the staged heap renamed into place and the primary index
    // remapped and flushed. `open` finishes or discards whatever a
    // crash leaves behind, keyed off the staged file and the epoch
    // pair (descriptor vs pk.idx).
    fn rewrite_meta(&mut self, schema: Schema) -> Result<()> {
        let meta_loc = util::to_location(&self.dir, META_HEAP_FILE);
        let tmp_loc = {
            let mut loc = meta_loc.clone();
            loc.push(".tmp");
            loc
        };
        let mut new_heap = MetaHeap::create_at(tmp_loc.clone(), schema.size())?;

        let items: Vec<(String, u64)> = self
            .pindex
            .iter()
            .map(|(pk, (_, meta_off))| (pk.clone(), *meta_off))
            .collect();
        let mut offsets = BTreeMap::new();
        // key order; recovery recomputes the k-th key's offset as
        // k * R and relies on it.
        for (pk, meta_off) in items {
            let old = self.schema.decode(&self.meta_heap.read(meta_off)?)?;
            let old_map = self.schema.to_map(&old);
            let rec: Vec<Value> = schema
                .as_fields()
                .iter()
                .map(|f| old_map.get(&f.name).cloned().unwrap_or_else(|| f.default.clone()))
                .collect();
            let off = new_heap.append(&schema.encode(&rec)?)?;
            offsets.insert(pk, off);
        }
        mem::drop(new_heap);

        // commit point.
        self.meta_epoch += 1;
        self.schema = schema;
        Self::write_root(&self.dir, &self.config, &self.schema, self.meta_epoch)?;

        err_at!(IOError, fs::rename(&tmp_loc, &meta_loc))?;
        self.meta_heap = MetaHeap::open(&self.dir, self.schema.size())?;
        self.pindex.set_meta_offsets(&offsets)?;
        self.pindex.set_meta_epoch(self.meta_epoch);
        // full flush: the remapped offsets exist only in memory until
        // pk.idx lands, and the log reset must not outrun triggers.idx.
        self.flush()
    }

    /// Promote `pk` to a vantage point: grow the schema by its
    /// distance field and cache the distance from every stored
    /// series to it.
    pub fn insert_vp(&mut self, pk: &str) -> Result<()> {
        let (ts_off, meta_off) = match self.pindex.get(pk) {
            Some(offs) => offs,
            None => err_at!(NotFound, msg: "pk {:?}", pk)?,
        };
        let record = self.schema.decode(&self.meta_heap.read(meta_off)?)?;
        let vp_pos = self.schema.field(schema::VP_FIELD).unwrap().0;
        if record[vp_pos] == Value::Bool(true) {
            err_at!(AlreadyExists, msg: "vantage point {:?}", pk)?
        }

        let dname = schema::d_vp_field(pk);
        let field = Field::new(&dname, FieldType::Float, Value::Float(0.0), IndexKind::Ordered)?;
        self.add_field_inner(field)?;

        let mut md = BTreeMap::new();
        md.insert(schema::VP_FIELD.to_string(), Value::Bool(true));
        self.upsert_meta_inner(pk, &md, false)?;

        let vts = self.ts_heap.read(ts_off)?;
        let items: Vec<(String, u64)> = self
            .pindex
            .iter()
            .map(|(other, (ts_off, _))| (other.clone(), *ts_off))
            .collect();
        for (other, ts_off) in items {
            let d = if other == pk {
                0.0
            } else {
                vpoint::distance(&self.ts_heap.read(ts_off)?, &vts)?
            };
            let mut md = BTreeMap::new();
            md.insert(dname.clone(), Value::Float(d));
            self.upsert_meta_inner(&other, &md, false)?;
        }
        self.flush()
    }

    /// Demote `pk` from vantage point; its distance field leaves the
    /// schema.
    pub fn delete_vp(&mut self, pk: &str) -> Result<()> {
        let meta_off = match self.pindex.get(pk) {
            Some((_, meta_off)) => meta_off,
            None => err_at!(NotFound, msg: "pk {:?}", pk)?,
        };
        let record = self.schema.decode(&self.meta_heap.read(meta_off)?)?;
        let vp_pos = self.schema.field(schema::VP_FIELD).unwrap().0;
        if record[vp_pos] != Value::Bool(true) {
            err_at!(InvalidArgument, msg: "{:?} is not a vantage point", pk)?
        }

        let mut md = BTreeMap::new();
        md.insert(schema::VP_FIELD.to_string(), Value::Bool(false));
        self.upsert_meta_inner(pk, &md, false)?;
        self.remove_field_inner(&schema::d_vp_field(pk))
    }

    /// Vantage points currently marked, in pk order.
    pub fn vps(&self) -> Result<Vec<String>> {
        let index = match self.indexes.get(schema::VP_FIELD) {
            Some(index) => index,
            None => err_at!(Fatal, msg: "vp index missing")?,
        };
        Ok(index
            .query(&Cmp::Eq(Value::Bool(true)))?
            .into_iter()
            .collect())
    }

    /// Top `top` nearest stored series to `query` under the
    /// cross-correlation distance. Candidates are pruned via the
    /// triangle inequality over the cached vantage-point distances,
    /// the cutoff doubling until at least `top` survive; exact
    /// distances refine the survivors.
    pub fn vp_similarity_search(
        &mut self,
        query: &TimeSeries,
        top: usize,
    ) -> Result<Vec<(String, f64)>> {
        if query.len() != self.config.ts_length {
            err_at!(
                InvalidArgument,
                msg: "series length {}/{}", query.len(), self.config.ts_length
            )?
        }
        if top == 0 {
            err_at!(InvalidArgument, msg: "top must be positive")?
        }

        let vps = self.vps()?;
        let candidates: BTreeSet<String> = if vps.is_empty() {
            self.pindex.pks().into_iter().collect()
        } else {
            let mut dq: Vec<(String, f64)> = vec![];
            for vp in vps.iter() {
                let ts_off = match self.pindex.get(vp) {
                    Some((ts_off, _)) => ts_off,
                    None => err_at!(Fatal, msg: "vantage point {:?} missing", vp)?,
                };
                let d = vpoint::distance(query, &self.ts_heap.read(ts_off)?)?;
                dq.push((vp.clone(), d));
            }

            let mut tau = dq
                .iter()
                .map(|(_, d)| *d)
                .fold(f64::INFINITY, f64::min)
                .max(1e-6);
            loop {
                let mut acc: Option<BTreeSet<String>> = None;
                for (vp, d) in dq.iter() {
                    let dname = schema::d_vp_field(vp);
                    let index = match self.indexes.get(&dname) {
                        Some(index) => index,
                        None => err_at!(Fatal, msg: "index {:?} missing", dname)?,
                    };
                    let lo = index.query(&Cmp::Ge(Value::Float(d - tau)))?;
                    let hi = index.query(&Cmp::Le(Value::Float(d + tau)))?;
                    let set: BTreeSet<String> = lo.intersection(&hi).cloned().collect();
                    acc = Some(intersect(acc, set));
                }
                let acc = acc.unwrap_or_default();
                if acc.len() >= top || tau > (2.0 * MAX_DISTANCE) {
                    break acc;
                }
                tau *= 2.0;
            }
        };

        let mut scored: Vec<(String, f64)> = vec![];
        for pk in candidates {
            let ts_off = match self.pindex.get(&pk) {
                Some((ts_off, _)) => ts_off,
                None => continue,
            };
            let d = vpoint::distance(query, &self.ts_heap.read(ts_off)?)?;
            scored.push((pk, d));
        }
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(top);
        Ok(scored)
    }

    /// Approximate nearest neighbor through the iSAX tree: descend
    /// to a terminal by SAX word, refine its entries by exact
    /// z-normalized Euclidean distance.
    pub fn isax_similarity_search(&mut self, query: &TimeSeries) -> Result<Option<(String, f64)>> {
        if query.len() != self.config.ts_length {
            err_at!(
                InvalidArgument,
                msg: "series length {}/{}", query.len(), self.config.ts_length
            )?
        }

        let word = self.sax.encode(query.as_values())?;
        let entries: Vec<(String, Vec<u8>)> = {
            let sax = &self.sax;
            self.isax
                .descend(&word, |a, b| sax.symbol_distance(a, b))
                .to_vec()
        };

        let mut best: Option<(String, f64)> = None;
        for (pk, _) in entries {
            let ts_off = match self.pindex.get(&pk) {
                Some((ts_off, _)) => ts_off,
                None => continue,
            };
            let ts = self.ts_heap.read(ts_off)?;
            let d = vpoint::znorm_euclidean(query.as_values(), ts.as_values());
            let better = match &best {
                Some((bpk, bd)) => match d.total_cmp(bd) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => pk < *bpk,
                    std::cmp::Ordering::Greater => false,
                },
                None => true,
            };
            if better {
                best = Some((pk, d));
            }
        }
        Ok(best)
    }

    /// Return true when `pk` is live and present in the iSAX tree.
    pub fn isax_contains(&mut self, pk: &str) -> Result<bool> {
        match self.pindex.get(pk) {
            None => Ok(false),
            Some((ts_off, _)) => {
                let ts = self.ts_heap.read(ts_off)?;
                let word = self.sax.encode(ts.as_values())?;
                Ok(self.isax.contains(pk, &word))
            }
        }
    }

    /// Fetch the raw series for `pk`.
    pub fn get_ts(&mut self, pk: &str) -> Result<TimeSeries> {
        match self.pindex.get(pk) {
            Some((ts_off, _)) => self.ts_heap.read(ts_off),
            None => err_at!(NotFound, msg: "pk {:?}", pk),
        }
    }

    /// Fetch the metadata record for `pk`, as a field-keyed map.
    pub fn get_meta(&mut self, pk: &str) -> Result<BTreeMap<String, Value>> {
        match self.pindex.get(pk) {
            Some((_, meta_off)) => {
                let record = self.schema.decode(&self.meta_heap.read(meta_off)?)?;
                Ok(self.schema.to_map(&record))
            }
            None => err_at!(NotFound, msg: "pk {:?}", pk),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.pindex.len()
    }

    pub fn contains(&self, pk: &str) -> bool {
        self.pindex.contains(pk)
    }

    pub fn as_schema(&self) -> &Schema {
        &self.schema
    }

    pub fn as_config(&self) -> &Config {
        &self.config
    }

    /// Register `proc` for triggers and augmented selects.
    pub fn register_proc(&mut self, name: &str, proc: crate::procs::Proc) {
        self.registry.register(name, proc);
    }

    /// Snapshot every structure and truncate the log. Auxiliary
    /// snapshots are written first, the primary index last; recovery
    /// treats the primary index as authoritative and rebuilds any
    /// disagreeing structure.
    pub fn flush(&mut self) -> Result<()> {
        let seqno = self.pindex.to_seqno();
        debug!(target: "tsdms", "flush at seqno {}", seqno);
        for index in self.indexes.values() {
            index.snapshot(&self.dir, seqno)?;
        }
        self.triggers.snapshot(&self.dir, seqno)?;
        self.isax.snapshot(&self.dir, seqno)?;
        self.pindex.snapshot(&self.dir)?;
        self.n_ops = 0;
        Ok(())
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            n_live: self.pindex.len(),
            n_ts_records: self.ts_heap.count()?,
            n_meta_records: self.meta_heap.count()?,
            seqno: self.pindex.to_seqno(),
            n_indexes: self.indexes.len(),
            n_triggers: self.triggers.len(),
            n_vps: self.vps()?.len(),
            n_isax: self.isax.len(),
        })
    }

    fn tick(&mut self) -> Result<()> {
        self.n_ops += 1;
        if self.n_ops >= self.config.flush_every {
            self.flush()
        } else {
            Ok(())
        }
    }
}

fn intersect(acc: Option<BTreeSet<String>>, set: BTreeSet<String>) -> BTreeSet<String> {
    match acc {
        Some(acc) => acc.intersection(&set).cloned().collect(),
        None => set,
    }
}

fn prefix_pk(err: Error, pk: &str) -> Error {
    match err {
        Error::Integrity(p, m) => Error::Integrity(p, format!("pk {:?}: {}", pk, m)),
        err => err,
    }
}

#[derive(Clone, Debug, Cborize)]
struct DiskRoot {
    ts_length: u64,
    word_len: u64,
    cardinality: u64,
    threshold: u64,
    meta_epoch: u64,
    schema: DiskSchema,
}

impl DiskRoot {
    const ID: u32 = ROOT_VER;
}

#[cfg(test)]
#[path = "tsdms_test.rs"]
mod tsdms_test;
