use cbordata::Cborize;

use std::{
    collections::{BTreeMap, BTreeSet},
    convert::TryFrom,
    ffi, fs,
    ops::Bound,
};

use crate::{
    err_at,
    index::index_location,
    schema::{DiskValue, Value},
    util, Error, Result,
};

const ORDERED_VER: u32 = 0x00050001;

/// Ordered-tree index: balanced ordered map from field value to the
/// set of primary keys carrying that value. For high-cardinality
/// fields; supports the full set of comparison operators.
pub struct OrderedIndex {
    name: String,
    tree: BTreeMap<Value, BTreeSet<String>>,
}

impl OrderedIndex {
    pub fn new(name: &str) -> OrderedIndex {
        OrderedIndex {
            name: name.to_string(),
            tree: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, value: &Value, pk: &str) -> Result<()> {
        self.tree
            .entry(value.clone())
            .or_insert_with(BTreeSet::new)
            .insert(pk.to_string());
        Ok(())
    }

    pub fn remove(&mut self, value: &Value, pk: &str) -> Result<()> {
        if let Some(pks) = self.tree.get_mut(value) {
            pks.remove(pk);
            if pks.is_empty() {
                self.tree.remove(value);
            }
        }
        Ok(())
    }

    pub fn query(&self, cmp: &crate::index::Cmp) -> Result<BTreeSet<String>> {
        use crate::index::Cmp;

        let mut acc = BTreeSet::new();
        match cmp {
            Cmp::Eq(value) => {
                if let Some(pks) = self.tree.get(value) {
                    acc.extend(pks.iter().cloned());
                }
            }
            Cmp::Ne(value) => {
                for (v, pks) in self.tree.iter() {
                    if v != value {
                        acc.extend(pks.iter().cloned());
                    }
                }
            }
            Cmp::Lt(value) => self.collect_range((Bound::Unbounded, Bound::Excluded(value)), &mut acc),
            Cmp::Le(value) => self.collect_range((Bound::Unbounded, Bound::Included(value)), &mut acc),
            Cmp::Gt(value) => self.collect_range((Bound::Excluded(value), Bound::Unbounded), &mut acc),
            Cmp::Ge(value) => self.collect_range((Bound::Included(value), Bound::Unbounded), &mut acc),
            Cmp::In(_) => err_at!(
                InvalidArgument,
                msg: "in-predicate on ordered index {:?}", self.name
            )?,
        }
        Ok(acc)
    }

    fn collect_range(
        &self,
        range: (Bound<&Value>, Bound<&Value>),
        acc: &mut BTreeSet<String>,
    ) {
        for (_, pks) in self.tree.range::<Value, _>(range) {
            acc.extend(pks.iter().cloned());
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn snapshot(&self, dir: &ffi::OsStr, seqno: u64) -> Result<()> {
        let items = self
            .tree
            .iter()
            .map(|(value, pks)| DiskItem {
                value: value.clone().into(),
                pks: pks.iter().cloned().collect(),
            })
            .collect();
        let ds = DiskOrdered { seqno, items };
        let data = util::into_cbor_bytes(ds)?;
        util::write_snapshot(&index_location(dir, &self.name), &data)
    }

    /// Load the snapshot for field `name`. Returns the index and the
    /// seqno it was taken at; None when there is no snapshot.
    pub fn load(dir: &ffi::OsStr, name: &str) -> Result<Option<(OrderedIndex, u64)>> {
        let loc = index_location(dir, name);
        if fs::metadata(&loc).is_err() {
            return Ok(None);
        }

        let data = util::read_snapshot(&loc)?;
        let (ds, _) = util::from_cbor_bytes::<DiskOrdered>(&data)?;

        let mut tree: BTreeMap<Value, BTreeSet<String>> = BTreeMap::new();
        for item in ds.items.into_iter() {
            let value = Value::try_from(item.value)?;
            tree.insert(value, item.pks.into_iter().collect());
        }

        let index = OrderedIndex {
            name: name.to_string(),
            tree,
        };
        Ok(Some((index, ds.seqno)))
    }
}

#[derive(Clone, Debug, Cborize)]
struct DiskItem {
    value: DiskValue,
    pks: Vec<String>,
}

impl DiskItem {
    const ID: u32 = ORDERED_VER;
}

#[derive(Clone, Debug, Cborize)]
struct DiskOrdered {
    seqno: u64,
    items: Vec<DiskItem>,
}

impl DiskOrdered {
    const ID: u32 = ORDERED_VER;
}

#[cfg(test)]
#[path = "ordered_test.rs"]
mod ordered_test;
