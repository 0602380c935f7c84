use cbordata::Cborize;
use croaring::bitmap::Bitmap;

use std::{
    collections::{BTreeMap, BTreeSet},
    convert::TryFrom,
    ffi, fs,
};

use crate::{
    err_at,
    index::{index_location, slots_location},
    schema::{DiskValue, Value},
    util, Error, Result,
};

const BITMAP_VER: u32 = 0x00060001;

/// Bitmap index: one roaring bitmap per distinct value, over compact
/// per-key slot ids. A parallel slot map, persisted alongside as
/// `index_<field>_pks.idx`, translates slot id to primary key. For
/// low-cardinality fields; supports `=`, `!=` and `in`.
pub struct BitmapIndex {
    name: String,
    values: BTreeMap<Value, Bitmap>,
    slots: Vec<Option<String>>, // slot-id -> pk
    by_pk: BTreeMap<String, u32>,
    free: Vec<u32>,
}

impl BitmapIndex {
    pub fn new(name: &str) -> BitmapIndex {
        BitmapIndex {
            name: name.to_string(),
            values: BTreeMap::new(),
            slots: Vec::default(),
            by_pk: BTreeMap::new(),
            free: Vec::default(),
        }
    }

    fn allocate(&mut self, pk: &str) -> Result<u32> {
        if let Some(slot) = self.by_pk.get(pk) {
            return Ok(*slot);
        }
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(pk.to_string());
                slot
            }
            None => {
                let slot = err_at!(FailConvert, u32::try_from(self.slots.len()))?;
                self.slots.push(Some(pk.to_string()));
                slot
            }
        };
        self.by_pk.insert(pk.to_string(), slot);
        Ok(slot)
    }

    // release the slot once no value's bitmap refers to it.
    fn release(&mut self, pk: &str, slot: u32) {
        if self.values.values().any(|bm| bm.contains(slot)) {
            return;
        }
        self.by_pk.remove(pk);
        self.slots[slot as usize] = None;
        self.free.push(slot);
    }

    pub fn insert(&mut self, value: &Value, pk: &str) -> Result<()> {
        let slot = self.allocate(pk)?;
        self.values
            .entry(value.clone())
            .or_insert_with(Bitmap::create)
            .add(slot);
        Ok(())
    }

    pub fn remove(&mut self, value: &Value, pk: &str) -> Result<()> {
        let slot = match self.by_pk.get(pk) {
            Some(slot) => *slot,
            None => return Ok(()),
        };
        if let Some(bm) = self.values.get_mut(value) {
            bm.remove(slot);
            if bm.is_empty() {
                self.values.remove(value);
            }
        }
        self.release(pk, slot);
        Ok(())
    }

    pub fn query(&self, cmp: &crate::index::Cmp) -> Result<BTreeSet<String>> {
        use crate::index::Cmp;

        let mut acc = BTreeSet::new();
        match cmp {
            Cmp::Eq(value) => {
                if let Some(bm) = self.values.get(value) {
                    self.collect(bm, &mut acc);
                }
            }
            Cmp::Ne(value) => {
                for (v, bm) in self.values.iter() {
                    if v != value {
                        self.collect(bm, &mut acc);
                    }
                }
            }
            Cmp::In(vs) => {
                for value in vs.iter() {
                    if let Some(bm) = self.values.get(value) {
                        self.collect(bm, &mut acc);
                    }
                }
            }
            _ => err_at!(
                InvalidArgument,
                msg: "range predicate on bitmap index {:?}", self.name
            )?,
        }
        Ok(acc)
    }

    fn collect(&self, bm: &Bitmap, acc: &mut BTreeSet<String>) {
        for slot in bm.iter() {
            if let Some(Some(pk)) = self.slots.get(slot as usize) {
                acc.insert(pk.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn snapshot(&self, dir: &ffi::OsStr, seqno: u64) -> Result<()> {
        let items = self
            .values
            .iter()
            .map(|(value, bm)| DiskItem {
                value: value.clone().into(),
                bitmap: bm.serialize(),
            })
            .collect();
        let data = util::into_cbor_bytes(DiskBitmap { seqno, items })?;
        util::write_snapshot(&index_location(dir, &self.name), &data)?;

        let slots = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, pk)| {
                pk.as_ref().map(|pk| DiskSlot {
                    slot: slot as u64,
                    pk: pk.clone(),
                })
            })
            .collect();
        let data = util::into_cbor_bytes(DiskSlots { seqno, slots })?;
        util::write_snapshot(&slots_location(dir, &self.name), &data)
    }

    /// Load the snapshot pair for field `name`. Returns the index
    /// and the seqno it was taken at; None when either file is
    /// missing or the pair disagrees on seqno.
    pub fn load(dir: &ffi::OsStr, name: &str) -> Result<Option<(BitmapIndex, u64)>> {
        let (loc1, loc2) = (index_location(dir, name), slots_location(dir, name));
        if fs::metadata(&loc1).is_err() || fs::metadata(&loc2).is_err() {
            return Ok(None);
        }

        let data = util::read_snapshot(&loc1)?;
        let (db, _) = util::from_cbor_bytes::<DiskBitmap>(&data)?;
        let data = util::read_snapshot(&loc2)?;
        let (dslots, _) = util::from_cbor_bytes::<DiskSlots>(&data)?;

        if db.seqno != dslots.seqno {
            return Ok(None);
        }

        let mut slots: Vec<Option<String>> = Vec::default();
        let mut by_pk = BTreeMap::new();
        for ds in dslots.slots.into_iter() {
            let slot = err_at!(FailConvert, usize::try_from(ds.slot))?;
            if slots.len() <= slot {
                slots.resize(slot + 1, None);
            }
            by_pk.insert(ds.pk.clone(), slot as u32);
            slots[slot] = Some(ds.pk);
        }
        let free = slots
            .iter()
            .enumerate()
            .filter(|(_, pk)| pk.is_none())
            .map(|(slot, _)| slot as u32)
            .collect();

        let mut values = BTreeMap::new();
        for item in db.items.into_iter() {
            let value = Value::try_from(item.value)?;
            values.insert(value, Bitmap::deserialize(&item.bitmap));
        }

        let index = BitmapIndex {
            name: name.to_string(),
            values,
            slots,
            by_pk,
            free,
        };
        Ok(Some((index, db.seqno)))
    }
}

#[derive(Clone, Debug, Cborize)]
struct DiskItem {
    value: DiskValue,
    bitmap: Vec<u8>,
}

impl DiskItem {
    const ID: u32 = BITMAP_VER;
}

#[derive(Clone, Debug, Cborize)]
struct DiskBitmap {
    seqno: u64,
    items: Vec<DiskItem>,
}

impl DiskBitmap {
    const ID: u32 = BITMAP_VER;
}

#[derive(Clone, Debug, Cborize)]
struct DiskSlot {
    slot: u64,
    pk: String,
}

impl DiskSlot {
    const ID: u32 = BITMAP_VER;
}

#[derive(Clone, Debug, Cborize)]
struct DiskSlots {
    seqno: u64,
    slots: Vec<DiskSlot>,
}

impl DiskSlots {
    const ID: u32 = BITMAP_VER;
}

#[cfg(test)]
#[path = "bitmap_test.rs"]
mod bitmap_test;
