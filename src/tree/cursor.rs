//! # Cursors and Range Iteration
//!
//! A [`Cursor`] is a detached bookmark into the tree: a stack of
//! `(node position, index)` frames from the root down to the current
//! element. The top frame names the node and key index the cursor stands
//! on; two cursors are equal exactly when their stacks match frame by
//! frame, and the empty stack is the past-the-end position.
//!
//! The cursor holds no reference to the tree — reads happen on its behalf
//! through [`BTree::entry_at`] and [`BTree::advance`] — so any number of
//! bookmarks can coexist and a `(lo, hi)` pair can delimit a range scan.
//! [`Range`] packages that pattern as a standard `Iterator`.
//!
//! ## Walk Order
//!
//! Advancing performs an in-order walk without parent pointers:
//!
//! - on an internal frame, the current element is a separator key; step the
//!   frame index past it and descend to the leftmost leaf of the following
//!   child
//! - on a leaf with keys remaining, bump the index
//! - on an exhausted leaf, pop frames until an ancestor frame's index still
//!   names a live key; that separator is the next element
//!
//! Cursors built from search paths are normalized with the same ascent rule
//! so that a bound landing past the last key of a leaf resolves to the
//! ancestor separator a walk would visit next.
//!
//! ## Invalidation
//!
//! Any mutation of the tree invalidates outstanding cursors. Using a stale
//! cursor never touches invalid memory — every access is a checked read —
//! but it may observe unspecified positions or report corruption.

use eyre::{ensure, Result};

use super::{BTree, PathStack};
use crate::codec::Codec;
use crate::order::Comparator;

/// Position in a tree: a root-to-element stack of frames, empty at end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    frames: PathStack,
}

impl Cursor {
    /// True for the past-the-end position.
    pub fn is_end(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Forward iterator over `[cur, stop)`, reading through an exclusive tree
/// borrow. Yields entries in ascending key order.
pub struct Range<'t, K, V, C, const T: usize> {
    tree: &'t mut BTree<K, V, C, T>,
    cur: Cursor,
    stop: Cursor,
}

impl<K: Codec, V: Codec, C: Comparator<K>, const T: usize> Iterator for Range<'_, K, V, C, T> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_end() || self.cur == self.stop {
            return None;
        }

        let entry = match self.tree.entry_at(&self.cur) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(err) => {
                self.cur = Cursor::default();
                return Some(Err(err));
            }
        };

        if let Err(err) = self.tree.advance(&mut self.cur) {
            self.cur = Cursor::default();
            return Some(Err(err));
        }
        Some(Ok(entry))
    }
}

impl<K: Codec, V: Codec, C: Comparator<K>, const T: usize> BTree<K, V, C, T> {
    /// Cursor at the smallest key, or the end cursor for an empty tree.
    pub fn begin(&mut self) -> Result<Cursor> {
        let mut frames = PathStack::new();
        let Some(root) = self.root_pos() else {
            return Ok(Cursor::default());
        };

        let mut pos = root;
        loop {
            let node = self.store.read_node(pos)?;
            frames.push((pos, 0));
            if node.is_leaf {
                break;
            }
            pos = node.children[0];
        }

        // A fresh tree has an empty leaf root; normalization turns that
        // into the end cursor.
        self.cursor_from_frames(frames)
    }

    /// The past-the-end cursor.
    pub fn end(&self) -> Cursor {
        Cursor::default()
    }

    /// Reads the entry the cursor stands on, or `None` at end.
    pub fn entry_at(&mut self, cursor: &Cursor) -> Result<Option<(K, V)>> {
        let Some(&(pos, idx)) = cursor.frames.last() else {
            return Ok(None);
        };
        let node = self.store.read_node(pos)?;
        ensure!(
            idx < node.len(),
            "stale cursor: index {} out of range in node {}",
            idx,
            pos
        );
        Ok(Some(node.entries[idx].clone()))
    }

    /// Steps the cursor to the next key in ascending order. Advancing the
    /// end cursor is a no-op.
    pub fn advance(&mut self, cursor: &mut Cursor) -> Result<()> {
        let Some(&(pos, idx)) = cursor.frames.last() else {
            return Ok(());
        };
        let node = self.store.read_node(pos)?;

        if !node.is_leaf {
            // Standing on a separator: the next element is the leftmost
            // leaf entry of the child to its right. The stepped frame index
            // makes the later ascent resume at the right separator.
            ensure!(
                idx + 1 < node.children.len(),
                "stale cursor: child {} out of range in node {}",
                idx + 1,
                pos
            );
            if let Some(top) = cursor.frames.last_mut() {
                top.1 = idx + 1;
            }

            let mut child_pos = node.children[idx + 1];
            loop {
                let child = self.store.read_node(child_pos)?;
                cursor.frames.push((child_pos, 0));
                if child.is_leaf {
                    break;
                }
                child_pos = child.children[0];
            }
            return Ok(());
        }

        if idx + 1 < node.len() {
            if let Some(top) = cursor.frames.last_mut() {
                top.1 = idx + 1;
            }
            return Ok(());
        }

        // Leaf exhausted: climb until an ancestor still owes a separator.
        cursor.frames.pop();
        while let Some(&(parent_pos, parent_idx)) = cursor.frames.last() {
            let parent = self.store.read_node(parent_pos)?;
            if parent_idx < parent.len() {
                break;
            }
            cursor.frames.pop();
        }
        Ok(())
    }

    /// Iterator over every entry in ascending key order.
    pub fn iter(&mut self) -> Result<Range<'_, K, V, C, T>> {
        let cur = self.begin()?;
        Ok(Range {
            tree: self,
            cur,
            stop: Cursor::default(),
        })
    }

    /// Iterator over the keys between `lower` and `upper`, each bound
    /// included or excluded per its flag. Requires `lower <= upper`.
    pub fn range(
        &mut self,
        lower: &K,
        upper: &K,
        include_lower: bool,
        include_upper: bool,
    ) -> Result<Range<'_, K, V, C, T>> {
        ensure!(
            !self.cmp.less(upper, lower),
            "range lower bound exceeds upper bound"
        );
        // lower == upper with both bounds excluded denotes the empty
        // interval; the bound protocol below would invert it.
        if !include_lower && !include_upper && self.cmp.equal(lower, upper) {
            return Ok(Range {
                tree: self,
                cur: Cursor::default(),
                stop: Cursor::default(),
            });
        }

        let (lo_frames, _, lo_found) = self.find_path(lower)?;
        let mut cur = self.cursor_from_frames(lo_frames)?;
        if lo_found && !include_lower {
            self.advance(&mut cur)?;
        }

        let (hi_frames, _, hi_found) = self.find_path(upper)?;
        let mut stop = self.cursor_from_frames(hi_frames)?;
        if hi_found && include_upper {
            self.advance(&mut stop)?;
        }

        Ok(Range {
            tree: self,
            cur,
            stop,
        })
    }

    /// Builds a cursor from a search path, popping frames whose index has
    /// run off their node so the position matches what an in-order walk
    /// would produce.
    fn cursor_from_frames(&mut self, frames: PathStack) -> Result<Cursor> {
        let mut cursor = Cursor { frames };
        while let Some(&(pos, idx)) = cursor.frames.last() {
            let node = self.store.read_node(pos)?;
            if idx < node.len() {
                break;
            }
            cursor.frames.pop();
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrdComparator;
    use tempfile::{tempdir, TempDir};

    type TestTree = BTree<i32, String, OrdComparator, 2>;

    fn open_tree() -> (TestTree, TempDir) {
        let dir = tempdir().unwrap();
        let tree = TestTree::open(dir.path().join("db")).unwrap();
        (tree, dir)
    }

    fn fill(tree: &mut TestTree, keys: impl IntoIterator<Item = i32>) {
        for key in keys {
            assert!(tree.insert(key, format!("v{}", key)).unwrap());
        }
    }

    fn range_keys(
        tree: &mut TestTree,
        lower: i32,
        upper: i32,
        include_lower: bool,
        include_upper: bool,
    ) -> Vec<i32> {
        tree.range(&lower, &upper, include_lower, include_upper)
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect()
    }

    #[test]
    fn begin_equals_end_on_fresh_tree() {
        let (mut tree, _dir) = open_tree();
        let begin = tree.begin().unwrap();
        assert!(begin.is_end());
        assert_eq!(begin, tree.end());
        assert_eq!(tree.entry_at(&begin).unwrap(), None);
    }

    #[test]
    fn iteration_crosses_separators_in_order() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, [8, 3, 5, 1, 9, 2, 7, 10, 4, 6]);

        let keys: Vec<i32> = tree.iter().unwrap().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn manual_advance_reaches_end() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, 1..=7);

        let mut cursor = tree.begin().unwrap();
        for expected in 1..=7 {
            let (key, value) = tree.entry_at(&cursor).unwrap().unwrap();
            assert_eq!(key, expected);
            assert_eq!(value, format!("v{}", expected));
            tree.advance(&mut cursor).unwrap();
        }
        assert!(cursor.is_end());

        // Advancing past the end stays there.
        tree.advance(&mut cursor).unwrap();
        assert_eq!(cursor, tree.end());
    }

    #[test]
    fn equal_positions_compare_equal() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, 1..=10);

        let a = tree.begin().unwrap();
        let b = tree.begin().unwrap();
        assert_eq!(a, b);

        let mut c = tree.begin().unwrap();
        tree.advance(&mut c).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn range_honors_inclusivity_flags() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, (1..=10).map(|k| k * 10));

        assert_eq!(range_keys(&mut tree, 30, 70, true, false), vec![30, 40, 50, 60]);
        assert_eq!(range_keys(&mut tree, 30, 70, true, true), vec![30, 40, 50, 60, 70]);
        assert_eq!(range_keys(&mut tree, 30, 70, false, false), vec![40, 50, 60]);
        assert_eq!(range_keys(&mut tree, 30, 70, false, true), vec![40, 50, 60, 70]);
    }

    #[test]
    fn range_with_absent_bounds_snaps_inward() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, (1..=10).map(|k| k * 10));

        assert_eq!(range_keys(&mut tree, 15, 55, true, true), vec![20, 30, 40, 50]);
        assert_eq!(range_keys(&mut tree, 15, 55, false, false), vec![20, 30, 40, 50]);
        assert_eq!(range_keys(&mut tree, 0, 1000, true, true), (1..=10).map(|k| k * 10).collect::<Vec<_>>());
    }

    #[test]
    fn range_upper_bound_past_leaf_end() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, (1..=10).map(|k| k * 10));

        // 55 lands past the last key of its leaf; the stop cursor must
        // resolve to the ancestor separator 60, not overshoot to the end.
        let keys = range_keys(&mut tree, 35, 55, true, true);
        assert_eq!(keys, vec![40, 50]);
    }

    #[test]
    fn range_collapses_on_degenerate_bounds() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, 1..=10);

        assert_eq!(range_keys(&mut tree, 5, 5, true, true), vec![5]);
        assert_eq!(range_keys(&mut tree, 5, 5, true, false), Vec::<i32>::new());
        assert_eq!(range_keys(&mut tree, 5, 5, false, true), Vec::<i32>::new());
        assert_eq!(range_keys(&mut tree, 5, 5, false, false), Vec::<i32>::new());
    }

    #[test]
    fn range_rejects_inverted_bounds() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, 1..=10);

        assert!(tree.range(&7, &3, true, true).is_err());
    }

    #[test]
    fn range_on_empty_tree_is_empty() {
        let (mut tree, _dir) = open_tree();
        assert_eq!(range_keys(&mut tree, 1, 100, true, true), Vec::<i32>::new());
    }

    #[test]
    fn range_between_adjacent_keys_is_empty() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, (1..=10).map(|k| k * 10));

        assert_eq!(range_keys(&mut tree, 41, 49, true, true), Vec::<i32>::new());
    }

    #[test]
    fn iteration_after_mutations_stays_sorted() {
        let (mut tree, _dir) = open_tree();
        fill(&mut tree, 1..=30);
        for key in (2..=30).step_by(3) {
            assert!(tree.erase(&key).unwrap());
        }

        let keys: Vec<i32> = tree.iter().unwrap().map(|e| e.unwrap().0).collect();
        let expected: Vec<i32> = (1..=30).filter(|k| (k - 2) % 3 != 0).collect();
        assert_eq!(keys, expected);
    }
}
