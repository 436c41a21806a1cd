//! # Paged Node Store
//!
//! The store owns the two files a tree lives in and is the only component
//! that touches their bytes:
//!
//! - **`<base>.tree`** — a 16-byte header followed by fixed-size node slots,
//!   indexed by `self_pos`. Slot size is derived from the minimum degree at
//!   compile time, so a slot index arithmetically yields a file offset.
//! - **`<base>.data`** — strictly append-only variable-length payloads. Each
//!   stored `(key, value)` pair is appended as key bytes then value bytes;
//!   the byte offset of the key is recorded in the owning node's slot.
//!
//! ## Slot Layout
//!
//! ```text
//! Offset            Size              Field
//! ----------------  ----------------  --------------------------------
//! 0                 8                 size (live key count, LE)
//! 8                 1                 is_leaf (0 or 1)
//! 9                 8                 self_pos (redundant, self-check)
//! 17                (MAX_KEYS + 2)*8  child slot indices, zero-padded
//! 17 + children     (MAX_KEYS + 1)*8  payload offsets, zero-padded
//! ```
//!
//! Slot offset in the tree file is `16 + self_pos * SLOT_SIZE`. The child
//! table holds `MAX_KEYS + 2` entries and the offset table `MAX_KEYS + 1` so
//! that a node one key over full — the transient state written between an
//! insert and its split — still fits its slot. Entries past `size` (past
//! `size + 1` for children) are written as zero and ignored on read.
//!
//! ## Write Protocol
//!
//! Writing a node appends a fresh payload for *every* live entry and
//! rewrites the whole slot. Old payload bytes become unreachable but stay in
//! the data file; nothing is ever reclaimed. This trades data-file growth
//! for a dead-simple offset-resolution protocol: an offset read from a slot
//! is always valid for the node image that recorded it.
//!
//! ## Durability
//!
//! Writes go straight to the OS (the files are unbuffered), so a clean
//! process exit leaves the structure consistent. [`NodeStore::sync`] forces
//! the OS buffers down for a stronger durability point, and the store syncs
//! best-effort when dropped. No guarantee is made if the process dies midway
//! through a multi-node mutation.
//!
//! ## Failure Conditions
//!
//! I/O errors propagate with file context attached. A slot whose recorded
//! `self_pos` disagrees with the slot index it was read from, or whose
//! `size` exceeds `MAX_KEYS`, is reported as corruption.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::IntoBytes;

use super::header::{TreeFileHeader, NO_NODE, TREE_HEADER_SIZE};
use super::node::Node;
use crate::codec::Codec;

/// Fixed word size of the file format: all slot fields are 8-byte LE words.
pub const WORD_SIZE: usize = 8;

/// Extension of the fixed-slot node file.
pub const TREE_FILE_EXTENSION: &str = "tree";
/// Extension of the append-only payload file.
pub const DATA_FILE_EXTENSION: &str = "data";

/// Owns the tree/data file pair and the in-memory copy of the file header.
///
/// `T` is the tree's minimum degree; it fixes the slot geometry and is part
/// of the on-disk format. Opening files written with a different `T` reads
/// garbage slots and is reported as corruption at the first self-check.
#[derive(Debug)]
pub struct NodeStore<K, V, const T: usize> {
    tree_file: File,
    data_file: File,
    tree_path: PathBuf,
    node_count: u64,
    root_pos: u64,
    _marker: PhantomData<(K, V)>,
}

impl<K: Codec, V: Codec, const T: usize> NodeStore<K, V, T> {
    pub const MIN_KEYS: usize = T - 1;
    pub const MAX_KEYS: usize = 2 * T - 1;
    pub const MAX_CHILDREN: usize = 2 * T;

    /// Fixed byte size of one node slot in the tree file.
    pub const SLOT_SIZE: usize = WORD_SIZE        // size
        + 1                                       // is_leaf
        + WORD_SIZE                               // self_pos
        + (Self::MAX_KEYS + 2) * WORD_SIZE        // child table
        + (Self::MAX_KEYS + 1) * WORD_SIZE; // payload-offset table

    /// Opens the file pair at `<base>.tree` / `<base>.data`, creating a
    /// fresh single-leaf tree if neither file exists yet.
    ///
    /// A half-present pair (one file exists, the other does not) is a
    /// construction error: the caller is pointing at a damaged or foreign
    /// set of files and silently recreating the missing half would orphan
    /// the survivor.
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        const { assert!(T >= 2, "minimum degree must be at least 2") };

        let tree_path = path_with_extension(base.as_ref(), TREE_FILE_EXTENSION);
        let data_path = path_with_extension(base.as_ref(), DATA_FILE_EXTENSION);

        let tree_exists = tree_path.exists();
        let data_exists = data_path.exists();

        match (tree_exists, data_exists) {
            (false, false) => Self::create(tree_path, data_path),
            (true, true) => Self::open_existing(tree_path, data_path),
            _ => bail!(
                "mixed file pair: '{}' {}, '{}' {}",
                tree_path.display(),
                if tree_exists { "exists" } else { "is missing" },
                data_path.display(),
                if data_exists { "exists" } else { "is missing" },
            ),
        }
    }

    fn create(tree_path: PathBuf, data_path: PathBuf) -> Result<Self> {
        let tree_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tree_path)
            .wrap_err_with(|| format!("failed to create tree file '{}'", tree_path.display()))?;

        let data_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&data_path)
            .wrap_err_with(|| format!("failed to create data file '{}'", data_path.display()))?;

        let mut store = Self {
            tree_file,
            data_file,
            tree_path,
            node_count: 0,
            root_pos: NO_NODE,
            _marker: PhantomData,
        };

        let root_pos = store.allocate()?;
        store.write_node(&Node::leaf(root_pos))?;
        store.set_root(Some(root_pos))?;

        Ok(store)
    }

    fn open_existing(tree_path: PathBuf, data_path: PathBuf) -> Result<Self> {
        let mut tree_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&tree_path)
            .wrap_err_with(|| format!("failed to open tree file '{}'", tree_path.display()))?;

        let data_file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&data_path)
            .wrap_err_with(|| format!("failed to open data file '{}'", data_path.display()))?;

        let mut buf = [0u8; TREE_HEADER_SIZE];
        tree_file
            .seek(SeekFrom::Start(0))
            .and_then(|_| tree_file.read_exact(&mut buf))
            .wrap_err_with(|| format!("failed to read header of '{}'", tree_path.display()))?;
        let header = TreeFileHeader::from_bytes(&buf)?;

        Ok(Self {
            node_count: header.node_count(),
            root_pos: header.root_pos(),
            tree_file,
            data_file,
            tree_path,
            _marker: PhantomData,
        })
    }

    /// Count of ever-allocated node slots. Monotonically increasing; merged-
    /// away nodes keep their slots forever.
    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    /// Slot index of the current root, or `None` for an empty tree.
    pub fn root_pos(&self) -> Option<u64> {
        (self.root_pos != NO_NODE).then_some(self.root_pos)
    }

    /// Repoints the root and persists the header.
    pub fn set_root(&mut self, pos: Option<u64>) -> Result<()> {
        self.root_pos = pos.unwrap_or(NO_NODE);
        self.write_header()
    }

    /// Allocates a fresh slot index and persists the new `node_count`.
    ///
    /// The slot's bytes are whatever was there before (usually nothing; the
    /// file grows on the first write); callers must write a node into it
    /// before any read.
    pub fn allocate(&mut self) -> Result<u64> {
        let pos = self.node_count;
        self.node_count += 1;
        self.write_header()?;
        Ok(pos)
    }

    fn write_header(&mut self) -> Result<()> {
        let header = TreeFileHeader::new(self.node_count, self.root_pos);
        self.tree_file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.tree_file.write_all(header.as_bytes()))
            .wrap_err_with(|| {
                format!("failed to write header of '{}'", self.tree_path.display())
            })
    }

    fn slot_offset(pos: u64) -> u64 {
        TREE_HEADER_SIZE as u64 + pos * Self::SLOT_SIZE as u64
    }

    /// Reads the node at `pos`, resolving its payload offsets against the
    /// data file.
    pub fn read_node(&mut self, pos: u64) -> Result<Node<K, V>> {
        ensure!(
            pos < self.node_count,
            "node position {} out of bounds (node_count={})",
            pos,
            self.node_count
        );

        let mut slot = vec![0u8; Self::SLOT_SIZE];
        self.tree_file
            .seek(SeekFrom::Start(Self::slot_offset(pos)))
            .and_then(|_| self.tree_file.read_exact(&mut slot))
            .wrap_err_with(|| format!("failed to read node slot {}", pos))?;

        let size = get_word(&slot, 0) as usize;
        let is_leaf = match slot[WORD_SIZE] {
            0 => false,
            1 => true,
            b => bail!("corrupt node slot {}: is_leaf byte is {}", pos, b),
        };
        let self_pos = get_word(&slot, WORD_SIZE + 1);

        ensure!(
            self_pos == pos,
            "corrupt node slot {}: recorded self_pos is {}",
            pos,
            self_pos
        );
        ensure!(
            size <= Self::MAX_KEYS,
            "corrupt node slot {}: size {} exceeds maximum {}",
            pos,
            size,
            Self::MAX_KEYS
        );

        let children_base = 2 * WORD_SIZE + 1;
        let children = if is_leaf {
            Vec::new()
        } else {
            (0..=size)
                .map(|i| get_word(&slot, children_base + i * WORD_SIZE))
                .collect()
        };

        let offsets_base = children_base + (Self::MAX_KEYS + 2) * WORD_SIZE;
        let mut entries = Vec::with_capacity(size);
        let mut payloads = BufReader::new(&mut self.data_file);
        for i in 0..size {
            let offset = get_word(&slot, offsets_base + i * WORD_SIZE);
            payloads
                .seek(SeekFrom::Start(offset))
                .wrap_err_with(|| format!("failed to seek payload of node {} key {}", pos, i))?;
            let key = K::read_from(&mut payloads)
                .wrap_err_with(|| format!("failed to decode key {} of node {}", i, pos))?;
            let value = V::read_from(&mut payloads)
                .wrap_err_with(|| format!("failed to decode value {} of node {}", i, pos))?;
            entries.push((key, value));
        }

        Ok(Node {
            pos,
            is_leaf,
            entries,
            children,
        })
    }

    /// Writes `node` into its slot, appending a fresh payload for every live
    /// entry.
    ///
    /// Accepts up to `MAX_KEYS + 1` entries: insert writes the overflowing
    /// node before splitting it, and the slot geometry reserves room for
    /// exactly that transient state.
    pub fn write_node(&mut self, node: &Node<K, V>) -> Result<()> {
        ensure!(
            node.len() <= Self::MAX_KEYS + 1,
            "node {} holds {} keys, beyond slot capacity {}",
            node.pos,
            node.len(),
            Self::MAX_KEYS + 1
        );
        if node.is_leaf {
            ensure!(
                node.children.is_empty(),
                "leaf node {} carries {} children",
                node.pos,
                node.children.len()
            );
        } else {
            ensure!(
                node.children.len() == node.len() + 1,
                "internal node {} has {} keys but {} children",
                node.pos,
                node.len(),
                node.children.len()
            );
        }

        let mut slot = Vec::with_capacity(Self::SLOT_SIZE);
        slot.extend_from_slice(&(node.len() as u64).to_le_bytes());
        slot.push(node.is_leaf as u8);
        slot.extend_from_slice(&node.pos.to_le_bytes());

        for i in 0..Self::MAX_KEYS + 2 {
            let child = node.children.get(i).copied().unwrap_or(0);
            slot.extend_from_slice(&child.to_le_bytes());
        }

        for i in 0..Self::MAX_KEYS + 1 {
            let offset = match node.entries.get(i) {
                Some(entry) => self.append_payload(entry)?,
                None => 0,
            };
            slot.extend_from_slice(&offset.to_le_bytes());
        }

        self.tree_file
            .seek(SeekFrom::Start(Self::slot_offset(node.pos)))
            .and_then(|_| self.tree_file.write_all(&slot))
            .wrap_err_with(|| format!("failed to write node slot {}", node.pos))
    }

    /// Appends one `(key, value)` payload and returns the byte offset of the
    /// key in the data file.
    fn append_payload(&mut self, (key, value): &(K, V)) -> Result<u64> {
        let offset = self
            .data_file
            .seek(SeekFrom::End(0))
            .wrap_err("failed to seek data file end")?;

        let mut payload = Vec::with_capacity(key.serialized_size() + value.serialized_size());
        key.write_to(&mut payload)?;
        value.write_to(&mut payload)?;

        self.data_file
            .write_all(&payload)
            .wrap_err_with(|| format!("failed to append payload at offset {}", offset))?;

        Ok(offset)
    }

    /// Forces both files down to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.tree_file.sync_data().wrap_err("failed to sync tree file")?;
        self.data_file.sync_data().wrap_err("failed to sync data file")
    }
}

impl<K, V, const T: usize> Drop for NodeStore<K, V, T> {
    fn drop(&mut self) {
        let _ = self.tree_file.sync_all();
        let _ = self.data_file.sync_all();
    }
}

fn path_with_extension(base: &Path, extension: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn get_word(buf: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; WORD_SIZE];
    word.copy_from_slice(&buf[offset..offset + WORD_SIZE]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    type TestStore = NodeStore<i32, String, 2>;

    fn pair(key: i32, value: &str) -> (i32, String) {
        (key, value.to_string())
    }

    #[test]
    fn slot_size_matches_layout() {
        // t=2: 8 + 1 + 8 + 5*8 + 4*8
        assert_eq!(TestStore::SLOT_SIZE, 89);
        assert_eq!(NodeStore::<i32, String, 3>::SLOT_SIZE, 8 + 1 + 8 + 7 * 8 + 6 * 8);
    }

    #[test]
    fn create_initializes_single_leaf_root() {
        let dir = tempdir().unwrap();
        let mut store = TestStore::open(dir.path().join("db")).unwrap();

        assert_eq!(store.node_count(), 1);
        assert_eq!(store.root_pos(), Some(0));

        let root = store.read_node(0).unwrap();
        assert!(root.is_leaf);
        assert!(root.is_empty());

        assert!(dir.path().join("db.tree").exists());
        assert!(dir.path().join("db.data").exists());
    }

    #[test]
    fn reopen_recovers_header() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db");

        {
            let mut store = TestStore::open(&base).unwrap();
            let pos = store.allocate().unwrap();
            store.write_node(&Node::leaf(pos)).unwrap();
            store.set_root(Some(pos)).unwrap();
        }

        let store = TestStore::open(&base).unwrap();
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.root_pos(), Some(1));
    }

    #[test]
    fn allocate_persists_node_count() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db");

        {
            let mut store = TestStore::open(&base).unwrap();
            for _ in 0..3 {
                let pos = store.allocate().unwrap();
                store.write_node(&Node::leaf(pos)).unwrap();
            }
        }

        // A reopened store must not hand out an already-used slot.
        let mut store = TestStore::open(&base).unwrap();
        assert_eq!(store.node_count(), 4);
        assert_eq!(store.allocate().unwrap(), 4);
    }

    #[test]
    fn mixed_file_pair_is_rejected() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db");
        drop(TestStore::open(&base).unwrap());
        std::fs::remove_file(dir.path().join("db.data")).unwrap();

        let err = TestStore::open(&base).unwrap_err();
        assert!(err.to_string().contains("mixed file pair"));
    }

    #[test]
    fn node_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let mut store = TestStore::open(dir.path().join("db")).unwrap();

        let mut leaf = Node::leaf(0);
        leaf.entries = vec![pair(1, "a"), pair(2, "bb"), pair(3, "")];
        store.write_node(&leaf).unwrap();

        let read = store.read_node(0).unwrap();
        assert!(read.is_leaf);
        assert_eq!(read.entries, leaf.entries);
        assert!(read.children.is_empty());

        let child_a = store.allocate().unwrap();
        let child_b = store.allocate().unwrap();
        store.write_node(&Node::leaf(child_a)).unwrap();
        store.write_node(&Node::leaf(child_b)).unwrap();

        let root_pos = store.allocate().unwrap();
        let mut root = Node::internal(root_pos);
        root.entries = vec![pair(10, "sep")];
        root.children = vec![child_a, child_b];
        store.write_node(&root).unwrap();

        let read = store.read_node(root_pos).unwrap();
        assert!(!read.is_leaf);
        assert_eq!(read.entries, root.entries);
        assert_eq!(read.children, vec![child_a, child_b]);
    }

    #[test]
    fn rewrite_abandons_old_payload_bytes() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db");
        let mut store = TestStore::open(&base).unwrap();

        let mut leaf = Node::leaf(0);
        leaf.entries = vec![pair(1, "first")];
        store.write_node(&leaf).unwrap();
        let size_after_first = std::fs::metadata(dir.path().join("db.data")).unwrap().len();

        leaf.entries[0].1 = "second".to_string();
        store.write_node(&leaf).unwrap();
        let size_after_second = std::fs::metadata(dir.path().join("db.data")).unwrap().len();

        assert!(size_after_second > size_after_first);
        assert_eq!(store.read_node(0).unwrap().entries[0].1, "second");
    }

    #[test]
    fn overflowed_node_fits_its_slot() {
        let dir = tempdir().unwrap();
        let mut store = TestStore::open(dir.path().join("db")).unwrap();

        // MAX_KEYS + 1 entries: the transient pre-split state.
        let mut leaf = Node::leaf(0);
        leaf.entries = (0..4).map(|i| pair(i, "v")).collect();
        store.write_node(&leaf).unwrap();

        // The slot accepts it, but a steady-state read reports corruption.
        let err = store.read_node(0).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn self_pos_mismatch_reports_corruption() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db");
        let mut store = TestStore::open(&base).unwrap();
        let pos = store.allocate().unwrap();
        store.write_node(&Node::leaf(pos)).unwrap();

        // Flip the recorded self_pos of slot 1 on disk.
        let slot_offset = TREE_HEADER_SIZE as u64 + TestStore::SLOT_SIZE as u64;
        let mut file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("db.tree"))
            .unwrap();
        file.seek(SeekFrom::Start(slot_offset + (WORD_SIZE as u64) + 1))
            .unwrap();
        file.write_all(&7u64.to_le_bytes()).unwrap();
        drop(file);

        let err = store.read_node(pos).unwrap_err();
        assert!(err.to_string().contains("self_pos"));
    }

    #[test]
    fn keyed_by_strings_round_trips() {
        let dir = tempdir().unwrap();
        let mut store: NodeStore<String, Vec<u32>, 2> =
            NodeStore::open(dir.path().join("db")).unwrap();

        let mut leaf = Node::leaf(0);
        leaf.entries = vec![
            ("alpha".to_string(), vec![1, 2]),
            ("beta".to_string(), vec![]),
        ];
        store.write_node(&leaf).unwrap();

        assert_eq!(store.read_node(0).unwrap().entries, leaf.entries);
    }
}
