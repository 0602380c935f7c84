//! Module `isax` implement the indexable-SAX tree, an n-ary tree
//! over SAX words supporting approximate nearest-neighbor queries.
//!
//! Terminal nodes hold up to `threshold` (pk, word) pairs. An
//! overflowing terminal splits on the word position showing maximum
//! symbol entropy; when no position discriminates the terminal is
//! allowed to exceed the threshold. Removal is lazy, empty terminals
//! are retained. Ownership is strictly downward, parent to child.

use cbordata::Cborize;

use std::{collections::BTreeMap, convert::TryFrom, ffi, fs, mem};

use crate::{err_at, util, Error, Result};

/// File name of the iSAX-tree snapshot, under the database directory.
pub const ISAX_FILE: &str = "isax.idx";

const ISAX_VER: u32 = 0x00070001;

enum Node {
    Internal {
        pos: usize,
        children: BTreeMap<u8, Node>,
    },
    Terminal {
        entries: Vec<(String, Vec<u8>)>,
    },
}

/// iSAX tree over the SAX words of every live series.
pub struct IsaxTree {
    word_len: usize,
    threshold: usize,
    root: Node,
    n_entries: usize,
}

impl IsaxTree {
    pub fn new(word_len: usize, threshold: usize) -> IsaxTree {
        IsaxTree {
            word_len,
            threshold,
            root: Node::Terminal {
                entries: Vec::default(),
            },
            n_entries: 0,
        }
    }

    /// Insert `(pk, word)`, splitting terminals as needed.
    pub fn insert(&mut self, pk: &str, word: Vec<u8>) -> Result<()> {
        if word.len() != self.word_len {
            err_at!(Fatal, msg: "word length {}/{}", word.len(), self.word_len)?
        }
        node_insert(&mut self.root, pk, word, self.threshold);
        self.n_entries += 1;
        Ok(())
    }

    /// Remove `pk`, locating its terminal by descending with the
    /// stored word. Empty terminals are retained.
    pub fn remove(&mut self, pk: &str, word: &[u8]) -> bool {
        let removed = node_remove(&mut self.root, pk, word);
        if removed {
            self.n_entries -= 1;
        }
        removed
    }

    /// Return true if `pk` is present under `word`.
    pub fn contains(&self, pk: &str, word: &[u8]) -> bool {
        let mut node = &self.root;
        loop {
            match node {
                Node::Terminal { entries } => break entries.iter().any(|(p, _)| p == pk),
                Node::Internal { pos, children } => match children.get(&word[*pos]) {
                    Some(child) => node = child,
                    None => break false,
                },
            }
        }
    }

    /// Entries at the terminal reached by descending with `word`.
    /// Where an internal node has no child for the word's symbol,
    /// follow the child nearest by `symdist` (breakpoint-space
    /// distance, ties to the smaller symbol).
    pub fn descend<F>(&self, word: &[u8], symdist: F) -> &[(String, Vec<u8>)]
    where
        F: Fn(u8, u8) -> f64,
    {
        let mut node = &self.root;
        loop {
            match node {
                Node::Terminal { entries } => break entries,
                Node::Internal { pos, children } => {
                    let sym = word[*pos];
                    node = match children.get(&sym) {
                        Some(child) => child,
                        None => {
                            // children is never empty, splits create
                            // at least two and removal keeps empties.
                            // Equidistant symbols tie to the smaller.
                            let near = children
                                .keys()
                                .min_by(|a, b| {
                                    let (da, db) = (symdist(**a, sym), symdist(**b, sym));
                                    da.total_cmp(&db).then_with(|| a.cmp(b))
                                })
                                .unwrap();
                            children.get(near).unwrap()
                        }
                    };
                }
            }
        }
    }

    /// Number of entries in the tree.
    pub fn len(&self) -> usize {
        self.n_entries
    }

    // every terminal's entry list, for invariant checks.
    pub(crate) fn terminals(&self) -> Vec<&[(String, Vec<u8>)]> {
        let mut acc = vec![];
        collect_terminals(&self.root, &mut acc);
        acc
    }

    #[inline]
    pub(crate) fn to_threshold(&self) -> usize {
        self.threshold
    }

    /// Serialize the tree post-order to `isax.idx` under `dir`,
    /// tagged with `seqno`.
    pub fn snapshot(&self, dir: &ffi::OsStr, seqno: u64) -> Result<()> {
        let mut nodes = vec![];
        post_order(&self.root, &mut nodes);
        let dt = DiskTree {
            seqno,
            word_len: self.word_len as u64,
            threshold: self.threshold as u64,
            nodes,
        };
        let data = util::into_cbor_bytes(dt)?;
        util::write_snapshot(&util::to_location(dir, ISAX_FILE), &data)
    }

    /// Load the snapshot under `dir`. Returns the tree and the seqno
    /// it was taken at; None when there is no snapshot or its
    /// parameters disagree.
    pub fn load(
        dir: &ffi::OsStr,
        word_len: usize,
        threshold: usize,
    ) -> Result<Option<(IsaxTree, u64)>> {
        let loc = util::to_location(dir, ISAX_FILE);
        if fs::metadata(&loc).is_err() {
            return Ok(None);
        }

        let data = util::read_snapshot(&loc)?;
        let (dt, _) = util::from_cbor_bytes::<DiskTree>(&data)?;
        if dt.word_len != (word_len as u64) || dt.threshold != (threshold as u64) {
            return Ok(None);
        }

        let mut stack: Vec<Node> = vec![];
        for dn in dt.nodes.into_iter() {
            match dn.kind {
                0 => {
                    if dn.words.len() != dn.pks.len() * word_len {
                        err_at!(Integrity, msg: "terminal words {} pks {}", dn.words.len(), dn.pks.len())?
                    }
                    let entries = dn
                        .pks
                        .into_iter()
                        .zip(dn.words.chunks(word_len))
                        .map(|(pk, word)| (pk, word.to_vec()))
                        .collect();
                    stack.push(Node::Terminal { entries });
                }
                1 => {
                    let k = dn.syms.len();
                    if stack.len() < k {
                        err_at!(Integrity, msg: "isax stack {}/{}", stack.len(), k)?
                    }
                    let nodes = stack.split_off(stack.len() - k);
                    // post-order pushed children in ascending symbol
                    // order, zip restores the keys.
                    let children = dn.syms.iter().copied().zip(nodes.into_iter()).collect();
                    let pos = err_at!(FailConvert, usize::try_from(dn.pos))?;
                    if pos >= word_len {
                        err_at!(Integrity, msg: "split position {}/{}", pos, word_len)?
                    }
                    stack.push(Node::Internal { pos, children });
                }
                kind => err_at!(Integrity, msg: "isax node kind {}", kind)?,
            }
        }

        if stack.len() != 1 {
            err_at!(Integrity, msg: "isax forest of {}", stack.len())?
        }
        let root = stack.pop().unwrap();

        let mut acc = vec![];
        collect_terminals(&root, &mut acc);
        let n_entries = acc.iter().map(|entries| entries.len()).sum();

        let tree = IsaxTree {
            word_len,
            threshold,
            root,
            n_entries,
        };
        Ok(Some((tree, dt.seqno)))
    }
}

fn node_insert(node: &mut Node, pk: &str, word: Vec<u8>, threshold: usize) {
    match node {
        Node::Internal { pos, children } => {
            let sym = word[*pos];
            match children.get_mut(&sym) {
                Some(child) => node_insert(child, pk, word, threshold),
                None => {
                    let child = Node::Terminal {
                        entries: vec![(pk.to_string(), word)],
                    };
                    children.insert(sym, child);
                }
            }
        }
        Node::Terminal { entries } => {
            entries.push((pk.to_string(), word));
            if entries.len() > threshold {
                node_split(node, threshold);
            }
        }
    }
}

// Convert an overflowing terminal into an internal node keyed at the
// highest-entropy position and redistribute; children may overflow
// again after redistribution and are split recursively. A terminal
// whose words agree at every position is left oversized.
fn node_split(node: &mut Node, threshold: usize) {
    let entries = match node {
        Node::Terminal { entries } => mem::take(entries),
        Node::Internal { .. } => unreachable!(),
    };

    let pos = match split_position(&entries) {
        Some(pos) => pos,
        None => {
            *node = Node::Terminal { entries };
            return;
        }
    };

    let mut children: BTreeMap<u8, Node> = BTreeMap::new();
    for (pk, word) in entries.into_iter() {
        let sym = word[pos];
        let child = children.entry(sym).or_insert_with(|| Node::Terminal {
            entries: Vec::default(),
        });
        match child {
            Node::Terminal { entries } => entries.push((pk, word)),
            Node::Internal { .. } => unreachable!(),
        }
    }
    for child in children.values_mut() {
        let n = match child {
            Node::Terminal { entries } => entries.len(),
            Node::Internal { .. } => 0,
        };
        if n > threshold {
            node_split(child, threshold);
        }
    }

    *node = Node::Internal { pos, children };
}

// Position with maximum symbol entropy; ties go to the smallest
// index; None when every position has a single symbol.
pub(crate) fn split_position(entries: &[(String, Vec<u8>)]) -> Option<usize> {
    let word_len = entries[0].1.len();
    let n = entries.len() as f64;

    let (mut best, mut best_h) = (None, 0.0_f64);
    for pos in 0..word_len {
        let mut counts: BTreeMap<u8, usize> = BTreeMap::new();
        for (_, word) in entries.iter() {
            *counts.entry(word[pos]).or_insert(0) += 1;
        }
        let h: f64 = counts
            .values()
            .map(|c| {
                let p = (*c as f64) / n;
                -p * p.ln()
            })
            .sum();
        if h > best_h {
            best = Some(pos);
            best_h = h;
        }
    }
    best
}

fn node_remove(node: &mut Node, pk: &str, word: &[u8]) -> bool {
    match node {
        Node::Terminal { entries } => match entries.iter().position(|(p, _)| p == pk) {
            Some(off) => {
                entries.remove(off);
                true
            }
            None => false,
        },
        Node::Internal { pos, children } => match children.get_mut(&word[*pos]) {
            Some(child) => node_remove(child, pk, word),
            None => false,
        },
    }
}

fn collect_terminals<'a>(node: &'a Node, acc: &mut Vec<&'a [(String, Vec<u8>)]>) {
    match node {
        Node::Terminal { entries } => acc.push(entries),
        Node::Internal { children, .. } => {
            for child in children.values() {
                collect_terminals(child, acc);
            }
        }
    }
}

fn post_order(node: &Node, acc: &mut Vec<DiskNode>) {
    match node {
        Node::Terminal { entries } => {
            let pks = entries.iter().map(|(pk, _)| pk.clone()).collect();
            let words = entries.iter().flat_map(|(_, w)| w.iter().copied()).collect();
            acc.push(DiskNode {
                kind: 0,
                pos: 0,
                syms: Vec::default(),
                pks,
                words,
            });
        }
        Node::Internal { pos, children } => {
            for child in children.values() {
                post_order(child, acc);
            }
            acc.push(DiskNode {
                kind: 1,
                pos: *pos as u64,
                syms: children.keys().copied().collect(),
                pks: Vec::default(),
                words: Vec::default(),
            });
        }
    }
}

#[derive(Clone, Debug, Cborize)]
struct DiskNode {
    kind: u64, // 0 terminal, 1 internal
    pos: u64,
    syms: Vec<u8>,
    pks: Vec<String>,
    words: Vec<u8>, // word_len bytes per pk
}

impl DiskNode {
    const ID: u32 = ISAX_VER;
}

#[derive(Clone, Debug, Cborize)]
struct DiskTree {
    seqno: u64,
    word_len: u64,
    threshold: u64,
    nodes: Vec<DiskNode>,
}

impl DiskTree {
    const ID: u32 = ISAX_VER;
}

#[cfg(test)]
#[path = "isax_test.rs"]
mod isax_test;
