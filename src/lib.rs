//! # loam - Disk-Resident B-Tree
//!
//! loam is an ordered key→value index whose nodes live in two files on local
//! storage: a fixed-slot `.tree` file holding the node structure and an
//! append-only `.data` file holding variable-length key/value payloads. It
//! supports point lookup, range scan, insertion, update, and deletion while
//! maintaining the classical B-tree balance invariants on disk.
//!
//! ## Quick Start
//!
//! ```ignore
//! use loam::BTree;
//!
//! let mut tree: BTree<i32, String> = BTree::open("./index")?;
//!
//! tree.insert(1, "one".to_string())?;
//! tree.insert(2, "two".to_string())?;
//!
//! assert_eq!(tree.get(&1)?, Some("one".to_string()));
//!
//! for entry in tree.range(&1, &2, true, true)? {
//!     let (key, value) = entry?;
//!     println!("{key} -> {value}");
//! }
//! ```
//!
//! ## Architecture
//!
//! loam is organized as four layers, leaves first:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Facade (BTree, Cursor)         │
//! ├─────────────────────────────────────┤
//! │  B-Tree Algorithms (split / merge)   │
//! ├─────────────────────────────────────┤
//! │   Paged Node Store (two files)       │
//! ├─────────────────────────────────────┤
//! │  Codec + Comparator (user types)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! <base>.tree      # 16-byte header + fixed-size node slots
//! <base>.data      # append-only serialized (key, value) payloads
//! ```
//!
//! Node slots have a fixed size derived from the minimum degree, so a slot
//! index converts to a file offset with pure arithmetic. Payloads are
//! appended on every node write; stale payload bytes are abandoned, never
//! reclaimed.
//!
//! ## Scope
//!
//! Single-threaded, blocking, synchronous. One open tree per file pair; the
//! caller provides exclusion if a tree is shared. No transactions, no crash
//! recovery beyond what the filesystem offers for unflushed writes, no
//! data-file compaction.
//!
//! ## Module Overview
//!
//! - [`codec`]: serialization contract for user key/value types
//! - [`order`]: the ordering predicate bound per tree instance
//! - [`storage`]: file header, node slots, payload append protocol
//! - [`tree`]: search, insert, erase, rebalance, cursors, validation

pub mod codec;
pub mod order;
pub mod storage;
pub mod tree;

pub use codec::Codec;
pub use order::{Comparator, OrdComparator};
pub use tree::{BTree, Cursor, Range};
