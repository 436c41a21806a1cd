//! # Storage Layer
//!
//! Everything that knows the two on-disk files exist lives here. A tree is
//! a pair of files sharing a base path:
//!
//! ```text
//! <base>.tree      # 16-byte header + fixed-size node slots
//! <base>.data      # append-only (key, value) payloads
//! ```
//!
//! The split keeps node geometry fixed while keys and values stay
//! variable-length: a slot stores byte offsets into the data file instead of
//! the payloads themselves, so any node can be located with pure arithmetic
//! (`16 + self_pos * SLOT_SIZE`) and read with a single seek.
//!
//! The data file only ever grows. Rewriting a node appends fresh payloads
//! and abandons the old bytes; reclamation is explicitly out of scope.
//!
//! ## Module Organization
//!
//! - [`header`]: the two-word file header (`node_count`, `root_pos`)
//! - [`node`]: the in-memory node the algorithms mutate
//! - [`store`]: file ownership, slot codec, payload append protocol
//!
//! Access above this layer goes through [`NodeStore`]; the algorithms never
//! see a file offset.

pub mod header;
pub mod node;
pub mod store;

pub use header::{TreeFileHeader, NO_NODE, TREE_HEADER_SIZE};
pub use node::Node;
pub use store::{NodeStore, DATA_FILE_EXTENSION, TREE_FILE_EXTENSION, WORD_SIZE};
