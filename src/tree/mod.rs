//! # B-Tree Algorithms
//!
//! This module implements the balance-preserving algorithms over the node
//! store: search, insertion with a bottom-up split cascade, deletion with
//! predecessor/successor replacement and borrow/merge rebalancing, and the
//! structural validator. All node access goes through [`NodeStore`]; the
//! algorithms never touch a file offset.
//!
//! ## Shape Invariants
//!
//! For minimum degree `T` (`MIN_KEYS = T - 1`, `MAX_KEYS = 2T - 1`), outside
//! an in-progress mutation:
//!
//! - every non-root node holds between `MIN_KEYS` and `MAX_KEYS` keys; the
//!   root holds at most `MAX_KEYS` (possibly zero only when it is a leaf)
//! - keys within a node are strictly increasing under the bound comparator
//! - an internal node with `n` keys has exactly `n + 1` children, and every
//!   key in child `i` lies strictly between the adjacent separators
//! - all leaves sit at the same depth
//!
//! ## Insert
//!
//! ```text
//! 1. Walk root -> leaf recording (node, chosen child index) frames
//! 2. Key present: return false
//! 3. Insert into the leaf at the found index, write it
//! 4. While the written node overflows (MAX_KEYS + 1 keys):
//!    - split at the lower median, allocate a right sibling
//!    - write both halves, push the median into the parent frame
//!    - no parent left: allocate a new root and repoint the header
//! ```
//!
//! The overflowing node is written before it is split; the slot layout
//! reserves room for exactly that one-over-full transient.
//!
//! ## Erase
//!
//! A key found in a leaf is removed directly; underflow is cured by
//! borrowing through the parent (left sibling preferred) or, when neither
//! sibling has a spare key, by merging with a sibling and the separator,
//! cascading upward. A key found in an internal node is replaced by its
//! in-order predecessor (left child has a spare key) or successor (right
//! child does); when neither child can give up a key, the two children are
//! merged through the separator and the removal continues inside the merged
//! subtree, which by construction can absorb it without further cascades.
//!
//! ## Durability Points
//!
//! Every mutated node is written back as soon as its in-memory shape is
//! final for the step, and the header is rewritten whenever the root moves
//! or a slot is allocated. Operations are not atomic across node writes; a
//! mid-operation crash leaves an inconsistent pair of files.

mod cursor;

use std::collections::HashSet;
use std::io::Write as IoWrite;
use std::path::Path;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::codec::Codec;
use crate::order::{Comparator, OrdComparator};
use crate::storage::{Node, NodeStore};

pub use cursor::{Cursor, Range};

/// Stack of `(node position, index)` frames from the root toward a node.
///
/// For internal frames the index is the child slot the walk descended into
/// (equivalently, the insertion position of the search key); for the
/// terminal frame it is the key index the search ended on.
pub(crate) type PathStack = SmallVec<[(u64, usize); 8]>;

/// Disk-resident B-tree of minimum degree `T`, ordered by `C`.
///
/// Owns the `<base>.tree` / `<base>.data` file pair. Movable, not clonable;
/// all operations run synchronously on the caller's thread. At most one
/// instance may be open on a given file pair.
#[derive(Debug)]
pub struct BTree<K, V, C = OrdComparator, const T: usize = 2> {
    store: NodeStore<K, V, T>,
    cmp: C,
}

impl<K: Codec, V: Codec, C: Comparator<K>, const T: usize> BTree<K, V, C, T> {
    pub const MIN_KEYS: usize = T - 1;
    pub const MAX_KEYS: usize = 2 * T - 1;

    /// Opens the tree at `<base>.tree` / `<base>.data`, creating a fresh
    /// empty tree if neither file exists. One existing file without the
    /// other is a construction error.
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        Self::open_with(base, C::default())
    }

    /// Opens with an explicit comparator instance. The comparator must
    /// order keys identically across every run against the same files.
    pub fn open_with<P: AsRef<Path>>(base: P, cmp: C) -> Result<Self> {
        Ok(Self {
            store: NodeStore::open(base)?,
            cmp,
        })
    }

    /// Count of ever-allocated node slots (includes unreachable ones).
    pub fn node_count(&self) -> u64 {
        self.store.node_count()
    }

    /// Slot index of the current root, or `None` for an empty tree.
    pub fn root_pos(&self) -> Option<u64> {
        self.store.root_pos()
    }

    /// Forces both files down to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    /// Looks up `key`, returning its value if present.
    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        let (path, idx, found) = self.find_path(key)?;
        if !found {
            return Ok(None);
        }
        let Some(&(pos, _)) = path.last() else {
            bail!("search reported a match with an empty path");
        };
        let node = self.store.read_node(pos)?;
        Ok(Some(node.entries[idx].1.clone()))
    }

    /// Inserts `(key, value)`. Returns `false` (and changes nothing) if the
    /// key is already present.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        let (mut path, idx, found) = self.find_path(&key)?;
        if found {
            return Ok(false);
        }

        let Some((leaf_pos, _)) = path.pop() else {
            // Tree emptied by erasure: start over with a fresh leaf root.
            let pos = self.store.allocate()?;
            let mut root = Node::leaf(pos);
            root.entries.push((key, value));
            self.store.write_node(&root)?;
            self.store.set_root(Some(pos))?;
            return Ok(true);
        };

        let mut leaf = self.store.read_node(leaf_pos)?;
        leaf.entries.insert(idx, (key, value));
        self.store.write_node(&leaf)?;

        if leaf.len() > Self::MAX_KEYS {
            self.split_cascade(&mut path, leaf)?;
        }
        Ok(true)
    }

    /// Replaces the value stored under `key`. Returns `false` if the key is
    /// absent.
    pub fn update(&mut self, key: &K, value: V) -> Result<bool> {
        let (path, idx, found) = self.find_path(key)?;
        if !found {
            return Ok(false);
        }
        let Some(&(pos, _)) = path.last() else {
            bail!("search reported a match with an empty path");
        };
        let mut node = self.store.read_node(pos)?;
        node.entries[idx].1 = value;
        self.store.write_node(&node)?;
        Ok(true)
    }

    /// Removes `key`. Returns `false` if the key is absent.
    pub fn erase(&mut self, key: &K) -> Result<bool> {
        let (mut path, idx, found) = self.find_path(key)?;
        if !found {
            return Ok(false);
        }
        let Some((pos, _)) = path.pop() else {
            bail!("search reported a match with an empty path");
        };
        let node = self.store.read_node(pos)?;

        if node.is_leaf {
            self.erase_from_leaf(&mut path, node, idx)?;
        } else {
            self.erase_from_internal(path, node, idx)?;
        }
        Ok(true)
    }

    /// Validates every structural invariant reachable from the root.
    ///
    /// Keys must be unique (which `insert` guarantees); boundary checks use
    /// the strict less-than predicate only.
    pub fn check_tree(&mut self) -> Result<()> {
        let Some(root) = self.store.root_pos() else {
            return Ok(());
        };
        let mut seen = HashSet::new();
        let mut leaf_depth = None;
        self.check_node(root, 0, None, None, &mut leaf_depth, &mut seen, true)
    }

    /// Writes an indented structural dump of the tree, one node per line.
    pub fn dump<W: IoWrite>(&mut self, out: &mut W) -> Result<()>
    where
        K: std::fmt::Debug,
        V: std::fmt::Debug,
    {
        match self.store.root_pos() {
            None => {
                writeln!(out, "<empty>")?;
                Ok(())
            }
            Some(root) => self.dump_node(out, root, 0),
        }
    }

    /// Walks from the root toward `key`, returning the visited frames, the
    /// index within the terminal node, and whether the key was found there.
    fn find_path(&mut self, key: &K) -> Result<(PathStack, usize, bool)> {
        let mut path = PathStack::new();
        let Some(root) = self.store.root_pos() else {
            return Ok((path, 0, false));
        };

        let mut pos = root;
        loop {
            let node = self.store.read_node(pos)?;
            let (idx, found) = self.find_index(key, &node);
            path.push((pos, idx));

            if found {
                return Ok((path, idx, true));
            }
            if node.is_leaf {
                return Ok((path, idx, false));
            }
            pos = node.children[idx];
        }
    }

    /// Index of the first key in `node` not less than `key`, plus whether it
    /// equals `key` (neither side less than the other).
    fn find_index(&self, key: &K, node: &Node<K, V>) -> (usize, bool) {
        let mut idx = 0;
        while idx < node.len() && self.cmp.less(&node.entries[idx].0, key) {
            idx += 1;
        }
        let found = idx < node.len() && !self.cmp.less(key, &node.entries[idx].0);
        (idx, found)
    }

    /// Splits `node` (holding `MAX_KEYS + 1` keys) and pushes the median up,
    /// repeating while parents overflow in turn.
    fn split_cascade(&mut self, path: &mut PathStack, mut node: Node<K, V>) -> Result<()> {
        loop {
            let mid = node.len() / 2;

            let right_pos = self.store.allocate()?;
            let mut right = if node.is_leaf {
                Node::leaf(right_pos)
            } else {
                Node::internal(right_pos)
            };

            right.entries = node.entries.split_off(mid + 1);
            let Some(median) = node.entries.pop() else {
                bail!("splitting node {} with no keys", node.pos);
            };
            if !node.is_leaf {
                right.children = node.children.split_off(mid + 1);
            }

            self.store.write_node(&node)?;
            self.store.write_node(&right)?;

            match path.pop() {
                None => {
                    // The root split: grow the tree by one level.
                    let root_pos = self.store.allocate()?;
                    let mut root = Node::internal(root_pos);
                    root.entries.push(median);
                    root.children = vec![node.pos, right_pos];
                    self.store.write_node(&root)?;
                    self.store.set_root(Some(root_pos))?;
                    return Ok(());
                }
                Some((parent_pos, parent_idx)) => {
                    let mut parent = self.store.read_node(parent_pos)?;
                    parent.entries.insert(parent_idx, median);
                    parent.children.insert(parent_idx + 1, right_pos);
                    self.store.write_node(&parent)?;

                    if parent.len() <= Self::MAX_KEYS {
                        return Ok(());
                    }
                    node = parent;
                }
            }
        }
    }

    fn erase_from_leaf(
        &mut self,
        path: &mut PathStack,
        mut leaf: Node<K, V>,
        idx: usize,
    ) -> Result<()> {
        leaf.entries.remove(idx);
        self.store.write_node(&leaf)?;

        if path.is_empty() {
            if leaf.is_empty() {
                self.store.set_root(None)?;
            }
        } else if leaf.len() < Self::MIN_KEYS {
            self.rebalance(path, leaf)?;
        }
        Ok(())
    }

    /// Erases the key at `node.entries[idx]` of an internal node.
    ///
    /// `path` holds the ancestors of `node` (empty when it is the root, or
    /// when invoked on a merged subtree whose loss can no longer propagate).
    fn erase_from_internal(
        &mut self,
        mut path: PathStack,
        mut node: Node<K, V>,
        idx: usize,
    ) -> Result<()> {
        let left_pos = node.children[idx];
        let left = self.store.read_node(left_pos)?;

        // Replace with the in-order predecessor from the left subtree.
        if left.len() > Self::MIN_KEYS {
            let mut spine = PathStack::new();
            spine.push((node.pos, idx));

            let mut pred = left;
            while !pred.is_leaf {
                spine.push((pred.pos, pred.len()));
                pred = self.store.read_node(pred.children[pred.len()])?;
            }

            let Some(replacement) = pred.entries.last().cloned() else {
                bail!("empty leaf on the predecessor spine of node {}", node.pos);
            };
            node.entries[idx] = replacement;
            self.store.write_node(&node)?;

            pred.entries.pop();
            self.store.write_node(&pred)?;

            if pred.len() < Self::MIN_KEYS {
                self.rebalance(&mut spine, pred)?;
            }
            return Ok(());
        }

        let right_pos = node.children[idx + 1];
        let right = self.store.read_node(right_pos)?;

        // Replace with the in-order successor from the right subtree.
        if right.len() > Self::MIN_KEYS {
            let mut spine = PathStack::new();
            spine.push((node.pos, idx + 1));

            let mut succ = right;
            while !succ.is_leaf {
                spine.push((succ.pos, 0));
                succ = self.store.read_node(succ.children[0])?;
            }

            let Some(replacement) = succ.entries.first().cloned() else {
                bail!("empty leaf on the successor spine of node {}", node.pos);
            };
            node.entries[idx] = replacement;
            self.store.write_node(&node)?;

            succ.entries.remove(0);
            self.store.write_node(&succ)?;

            if succ.len() < Self::MIN_KEYS {
                self.rebalance(&mut spine, succ)?;
            }
            return Ok(());
        }

        // Both children sit at MIN_KEYS: merge them through the separator,
        // then take the erased key out of the merged subtree. The merged
        // node holds MAX_KEYS keys, so the removal below cannot underflow
        // it and the cascade stops there.
        let mut left = left;
        let separator = node.entries.remove(idx);
        node.children.remove(idx + 1);

        let sep_idx = left.len();
        left.entries.push(separator);
        left.entries.extend(right.entries);
        if !left.is_leaf {
            left.children.extend(right.children);
        }

        if left.is_leaf {
            // The erased key is the separator itself; drop it in the same
            // write.
            left.entries.remove(sep_idx);
        }
        self.store.write_node(&left)?;
        self.store.write_node(&node)?;

        if path.is_empty() {
            if node.is_empty() {
                self.store.set_root(Some(left.pos))?;
            }
        } else if node.len() < Self::MIN_KEYS {
            self.rebalance(&mut path, node)?;
        }

        if !left.is_leaf {
            return self.erase_from_internal(PathStack::new(), left, sep_idx);
        }
        Ok(())
    }

    /// Cures an underflowing non-root `node` by borrowing from a sibling
    /// through the parent, or merging with one, walking up `path` while
    /// parents underflow in turn. Left siblings are preferred for both.
    fn rebalance(&mut self, path: &mut PathStack, mut node: Node<K, V>) -> Result<()> {
        loop {
            if node.len() >= Self::MIN_KEYS {
                return Ok(());
            }
            let Some((parent_pos, _)) = path.pop() else {
                return Ok(());
            };
            let mut parent = self.store.read_node(parent_pos)?;

            let Some(k) = parent.children.iter().position(|&c| c == node.pos) else {
                bail!("node {} is not a child of its path parent {}", node.pos, parent_pos);
            };

            // Borrow through the parent from the left sibling.
            if k > 0 {
                let mut left = self.store.read_node(parent.children[k - 1])?;
                if left.len() > Self::MIN_KEYS {
                    let Some(donated) = left.entries.pop() else {
                        bail!("left sibling of node {} has no key to donate", node.pos);
                    };
                    let separator = std::mem::replace(&mut parent.entries[k - 1], donated);
                    node.entries.insert(0, separator);
                    if !node.is_leaf {
                        let Some(child) = left.children.pop() else {
                            bail!("left sibling of node {} has no child to donate", node.pos);
                        };
                        node.children.insert(0, child);
                    }

                    self.store.write_node(&left)?;
                    self.store.write_node(&parent)?;
                    self.store.write_node(&node)?;
                    return Ok(());
                }
            }

            // Borrow from the right sibling.
            if k < parent.len() {
                let mut right = self.store.read_node(parent.children[k + 1])?;
                if right.len() > Self::MIN_KEYS {
                    let donated = right.entries.remove(0);
                    let separator = std::mem::replace(&mut parent.entries[k], donated);
                    node.entries.push(separator);
                    if !node.is_leaf {
                        node.children.push(right.children.remove(0));
                    }

                    self.store.write_node(&right)?;
                    self.store.write_node(&parent)?;
                    self.store.write_node(&node)?;
                    return Ok(());
                }
            }

            // No spare keys on either side: merge with a sibling plus the
            // separator. The merged node ends at 2 * MIN_KEYS + 1 keys.
            if k > 0 {
                let mut left = self.store.read_node(parent.children[k - 1])?;
                let separator = parent.entries.remove(k - 1);
                parent.children.remove(k);

                left.entries.push(separator);
                left.entries.append(&mut node.entries);
                if !left.is_leaf {
                    left.children.append(&mut node.children);
                }

                self.store.write_node(&left)?;
                self.store.write_node(&parent)?;

                if path.is_empty() {
                    if parent.is_empty() {
                        // The root gave up its last separator: drop a level.
                        self.store.set_root(Some(left.pos))?;
                    }
                    return Ok(());
                }
                node = parent;
                continue;
            }

            ensure!(
                k < parent.len(),
                "underflowing node {} has no sibling to merge with",
                node.pos
            );
            let mut right = self.store.read_node(parent.children[k + 1])?;
            let separator = parent.entries.remove(k);
            parent.children.remove(k + 1);

            node.entries.push(separator);
            node.entries.append(&mut right.entries);
            if !node.is_leaf {
                node.children.append(&mut right.children);
            }

            self.store.write_node(&node)?;
            self.store.write_node(&parent)?;

            if path.is_empty() {
                if parent.is_empty() {
                    self.store.set_root(Some(node.pos))?;
                }
                return Ok(());
            }
            node = parent;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &mut self,
        pos: u64,
        depth: usize,
        lower: Option<K>,
        upper: Option<K>,
        leaf_depth: &mut Option<usize>,
        seen: &mut HashSet<u64>,
        is_root: bool,
    ) -> Result<()> {
        ensure!(
            pos < self.store.node_count(),
            "node {} lies past the allocated slots ({})",
            pos,
            self.store.node_count()
        );
        ensure!(seen.insert(pos), "node {} is reachable more than once", pos);

        let node = self.store.read_node(pos)?;

        if !is_root {
            ensure!(
                node.len() >= Self::MIN_KEYS,
                "node {} underflows: {} keys",
                pos,
                node.len()
            );
        }
        if !node.is_leaf {
            ensure!(!node.is_empty(), "internal node {} has no keys", pos);
        }

        for pair in node.entries.windows(2) {
            ensure!(
                self.cmp.less(&pair[0].0, &pair[1].0),
                "keys out of order in node {}",
                pos
            );
        }
        if let (Some(lo), Some((first, _))) = (&lower, node.entries.first()) {
            ensure!(
                self.cmp.less(lo, first),
                "node {} violates its lower separator",
                pos
            );
        }
        if let (Some(hi), Some((last, _))) = (&upper, node.entries.last()) {
            ensure!(
                self.cmp.less(last, hi),
                "node {} violates its upper separator",
                pos
            );
        }

        if node.is_leaf {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) => ensure!(
                    depth == expected,
                    "leaf {} at depth {}, expected {}",
                    pos,
                    depth,
                    expected
                ),
            }
            return Ok(());
        }

        for i in 0..=node.len() {
            let child_lower = if i == 0 {
                lower.clone()
            } else {
                Some(node.entries[i - 1].0.clone())
            };
            let child_upper = if i == node.len() {
                upper.clone()
            } else {
                Some(node.entries[i].0.clone())
            };
            self.check_node(
                node.children[i],
                depth + 1,
                child_lower,
                child_upper,
                leaf_depth,
                seen,
                false,
            )?;
        }
        Ok(())
    }

    fn dump_node<W: IoWrite>(&mut self, out: &mut W, pos: u64, level: usize) -> Result<()>
    where
        K: std::fmt::Debug,
        V: std::fmt::Debug,
    {
        let node = self.store.read_node(pos)?;

        write!(
            out,
            "{:indent$}{} (pos={}) keys:",
            "",
            if node.is_leaf { "Leaf" } else { "Internal" },
            pos,
            indent = level * 4
        )?;
        for (key, value) in &node.entries {
            write!(out, " ({:?}:{:?})", key, value)?;
        }
        writeln!(out)?;

        if !node.is_leaf {
            for &child in &node.children {
                self.dump_node(out, child, level + 1)?;
            }
        }
        Ok(())
    }
}
